//! Streaming sample-rate and channel conversion for sample sources
//! Uses linear interpolation, which is plenty for two-tone FSK

use crate::error::Result;
use std::iter::Fuse;

/// Average interleaved multi-channel frames down to mono
///
/// A trailing partial frame is dropped.
pub struct Downmix<I> {
    source: I,
    channels: usize,
}

impl<I> Downmix<I> {
    pub fn new(source: I, channels: usize) -> Self {
        Self {
            source,
            channels: channels.max(1),
        }
    }
}

impl<I: Iterator<Item = Result<f32>>> Iterator for Downmix<I> {
    type Item = Result<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut sum = 0.0;
        for _ in 0..self.channels {
            match self.source.next()? {
                Ok(sample) => sum += sample,
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(sum / self.channels as f32))
    }
}

/// Resample a source to a target rate using linear interpolation
///
/// Output sample `k` sits at source position `k * from_rate / to_rate`; past
/// the last source sample the final value is held, matching the slice helper.
pub struct Resampler<I: Iterator> {
    source: Fuse<I>,
    step: f64,
    index: u64,
    current: Option<f32>,
    following: Option<f32>,
    emitted: u64,
    primed: bool,
    done: bool,
}

impl<I: Iterator<Item = Result<f32>>> Resampler<I> {
    pub fn new(source: I, from_rate: usize, to_rate: usize) -> Self {
        Self {
            source: source.fuse(),
            step: from_rate as f64 / to_rate as f64,
            index: 0,
            current: None,
            following: None,
            emitted: 0,
            primed: false,
            done: false,
        }
    }

    fn pull(&mut self) -> Result<Option<f32>> {
        self.source.next().transpose()
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.following;
        self.following = match self.current {
            Some(_) => self.pull()?,
            None => None,
        };
        self.index += 1;
        Ok(())
    }
}

impl<I: Iterator<Item = Result<f32>>> Iterator for Resampler<I> {
    type Item = Result<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.primed {
            self.primed = true;
            let primed = self.pull().and_then(|first| {
                self.current = first;
                self.following = self.pull()?;
                Ok(())
            });
            if let Err(e) = primed {
                self.done = true;
                return Some(Err(e));
            }
        }

        let position = self.emitted as f64 * self.step;
        while self.current.is_some() && (self.index + 1) as f64 <= position {
            if let Err(e) = self.advance() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let Some(current) = self.current else {
            self.done = true;
            return None;
        };
        let fraction = (position - self.index as f64) as f32;
        let value = match self.following {
            Some(following) => current * (1.0 - fraction) + following * fraction,
            None => current,
        };
        self.emitted += 1;
        Some(Ok(value))
    }
}

/// Resample a whole buffer to a target sample rate
///
/// # Example
/// ```ignore
/// let audio_44k = vec![0.1, 0.2, 0.3, ...]; // audio at 44.1kHz
/// let audio_48k = resample_audio(&audio_44k, 44100, 48000);
/// ```
pub fn resample_audio(samples: &[f32], from_rate: usize, to_rate: usize) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    Resampler::new(samples.iter().map(|&s| Ok(s)), from_rate, to_rate)
        .filter_map(|s| s.ok())
        .collect()
}
