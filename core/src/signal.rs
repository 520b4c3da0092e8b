//! PCM sample sources and sinks
//!
//! A sample source is any iterator of `Result<f32>` at `SAMPLE_RATE`, mono,
//! full scale = 1.0. Sinks accept blocks of samples and are finished once.

use crate::error::{CodecError, Result};
use crate::pipeline::CancelToken;
use std::io::{self, BufReader, BufWriter, Read, Write};

/// Convert a dB adjustment into a linear amplitude factor
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Scale a float sample to signed 16-bit, clamping to full scale
pub fn to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * 32767.0) as i16
}

pub fn from_i16(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Wrap an in-memory buffer as a sample source
pub fn from_slice(samples: &[f32]) -> impl Iterator<Item = Result<f32>> + '_ {
    samples.iter().map(|&s| Ok(s))
}

pub trait SampleSink {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Flush buffered output; called once after the last block
    fn finish(&mut self) -> Result<()>;
}

impl SampleSink for Vec<f32> {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.extend_from_slice(samples);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads signed 16-bit little-endian mono PCM
pub struct RawPcmReader<R: Read> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: Read> RawPcmReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            done: false,
        }
    }
}

impl<R: Read> Iterator for RawPcmReader<R> {
    type Item = Result<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut frame = [0u8; 2];
        match self.reader.read_exact(&mut frame) {
            Ok(()) => Some(Ok(from_i16(i16::from_le_bytes(frame)))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(CodecError::Io(e)))
            }
        }
    }
}

/// Writes signed 16-bit little-endian mono PCM
pub struct RawPcmWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> RawPcmWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }
}

impl<W: Write> SampleSink for RawPcmWriter<W> {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        for &sample in samples {
            self.writer.write_all(&to_i16(sample).to_le_bytes())?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Ends a sample source with `Interrupted` once the token is cancelled
pub struct Cancellable<I> {
    inner: I,
    token: CancelToken,
    tripped: bool,
}

impl<I> Cancellable<I> {
    pub fn new(inner: I, token: CancelToken) -> Self {
        Self {
            inner,
            token,
            tripped: false,
        }
    }
}

impl<I: Iterator<Item = Result<f32>>> Iterator for Cancellable<I> {
    type Item = Result<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tripped {
            return None;
        }
        if self.token.is_cancelled() {
            self.tripped = true;
            return Some(Err(CodecError::Interrupted));
        }
        self.inner.next()
    }
}
