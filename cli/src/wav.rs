//! WAV and raw PCM plumbing between files/stdio and the codec

use crate::error::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use tapecodec_core::resample::{Downmix, Resampler};
use tapecodec_core::signal::{to_i16, RawPcmReader, RawPcmWriter, SampleSink};
use tapecodec_core::{CodecError, SAMPLE_RATE};
use tracing::{debug, info};

pub type SampleSource = Box<dyn Iterator<Item = tapecodec_core::Result<f32>>>;

fn wav_error(error: hound::Error) -> CodecError {
    match error {
        hound::Error::IoError(e) => CodecError::Io(e),
        other => CodecError::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}

/// Samples of a WAV file, converted to mono at `SAMPLE_RATE` on the fly
pub fn wav_source(path: &Path) -> Result<SampleSource> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    info!(
        "Reading {}: {} Hz, {} channel(s), {} bits",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    let samples: Box<dyn Iterator<Item = tapecodec_core::Result<f32>>> = match spec.sample_format {
        SampleFormat::Float => Box::new(
            reader
                .into_samples::<f32>()
                .map(|s| s.map_err(wav_error)),
        ),
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            Box::new(
                reader
                    .into_samples::<i32>()
                    .map(move |s| s.map(|v| v as f32 * scale).map_err(wav_error)),
            )
        }
    };

    let mono = Downmix::new(samples, spec.channels as usize);
    let rate = spec.sample_rate as usize;
    if rate == SAMPLE_RATE {
        Ok(Box::new(mono))
    } else {
        debug!("Resampling {} Hz to {} Hz", rate, SAMPLE_RATE);
        Ok(Box::new(Resampler::new(mono, rate, SAMPLE_RATE)))
    }
}

/// WAV file if a path is given, otherwise raw s16le mono PCM on stdin
pub fn open_source(input: Option<&Path>) -> Result<SampleSource> {
    match input {
        Some(path) => wav_source(path),
        None => {
            info!("Reading raw 16-bit PCM at {} Hz from stdin", SAMPLE_RATE);
            Ok(Box::new(RawPcmReader::new(io::stdin().lock())))
        }
    }
}

/// 16-bit mono WAV writer at `SAMPLE_RATE`
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: &Path) -> Result<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE as u32,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        Ok(Self {
            writer: Some(WavWriter::create(path, spec)?),
        })
    }
}

impl SampleSink for WavSink {
    fn write(&mut self, samples: &[f32]) -> tapecodec_core::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WAV writer already finalized",
            )));
        };
        for &sample in samples {
            writer.write_sample(to_i16(sample)).map_err(wav_error)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> tapecodec_core::Result<()> {
        match self.writer.take() {
            Some(writer) => writer.finalize().map_err(wav_error),
            None => Ok(()),
        }
    }
}

/// WAV file if a path is given, otherwise raw s16le mono PCM on stdout
pub fn open_sink(output: Option<&Path>) -> Result<Box<dyn SampleSink>> {
    match output {
        Some(path) => {
            info!("Writing {}", path.display());
            Ok(Box::new(WavSink::create(path)?))
        }
        None => Ok(Box::new(RawPcmWriter::new(io::stdout().lock()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_wav(path: &Path) -> Vec<f32> {
        wav_source(path)
            .unwrap()
            .collect::<tapecodec_core::Result<Vec<f32>>>()
            .unwrap()
    }

    fn write_wav(path: &Path, spec: WavSpec, samples: &[i16]) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavSink::create(&path).unwrap();
        sink.write(&[0.0, 0.5, -0.5]).unwrap();
        sink.finish().unwrap();
        assert!(sink.write(&[0.1]).is_err());

        let samples = read_wav(&path);
        assert_eq!(samples.len(), 3);
        assert!((samples[1] - 0.5).abs() < 1e-3);
        assert!((samples[2] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE as u32,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[16384, 0, -16384, -16384]);
        let samples = read_wav(&path);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_other_rates_are_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("24k.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 24000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[1000; 100]);
        let samples = read_wav(&path);
        assert!((samples.len() as i64 - 200).abs() <= 2, "{}", samples.len());
    }
}
