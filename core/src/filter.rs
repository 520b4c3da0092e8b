//! Input conditioning ahead of tone detection: gain and band limiting

use crate::error::{CodecError, Result};
use crate::protocol::ProtocolSpec;
use crate::signal::db_to_gain;
use crate::SAMPLE_RATE;
use std::f32::consts::PI;
use std::str::FromStr;

const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Second-order IIR section, transposed direct form II
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn lowpass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let omega = 2.0 * PI * cutoff / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * q);

        Self::normalized(
            (1.0 - cos_omega) / 2.0,
            1.0 - cos_omega,
            (1.0 - cos_omega) / 2.0,
            1.0 + alpha,
            -2.0 * cos_omega,
            1.0 - alpha,
        )
    }

    pub fn highpass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let omega = 2.0 * PI * cutoff / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * q);

        Self::normalized(
            (1.0 + cos_omega) / 2.0,
            -(1.0 + cos_omega),
            (1.0 + cos_omega) / 2.0,
            1.0 + alpha,
            -2.0 * cos_omega,
            1.0 - alpha,
        )
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Pass band for the optional pre-filter, in Hz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandPass {
    pub low_hz: f32,
    pub high_hz: f32,
}

impl BandPass {
    pub fn new(low_hz: f32, high_hz: f32) -> Result<Self> {
        let nyquist = SAMPLE_RATE as f32 / 2.0;
        if !(low_hz > 0.0 && low_hz < high_hz && high_hz < nyquist) {
            return Err(CodecError::InvalidConfig(format!(
                "band-pass {}..{} Hz must satisfy 0 < low < high < {} Hz",
                low_hz, high_hz, nyquist
            )));
        }
        Ok(Self { low_hz, high_hz })
    }

    /// One octave of margin below and above the protocol's two tones
    pub fn for_protocol(spec: &ProtocolSpec) -> Self {
        let low = spec.mark_hz.min(spec.space_hz) / 2.0;
        let high = (spec.mark_hz.max(spec.space_hz) * 2.0).min(SAMPLE_RATE as f32 * 0.45);
        Self {
            low_hz: low,
            high_hz: high,
        }
    }
}

impl FromStr for BandPass {
    type Err = CodecError;

    /// Parses `LOW:HIGH` in Hz, e.g. `600:5000`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CodecError::InvalidConfig(format!("expected LOW:HIGH in Hz, got '{}'", s));
        let (low, high) = s.split_once(':').ok_or_else(invalid)?;
        let low: f32 = low.trim().parse().map_err(|_| invalid())?;
        let high: f32 = high.trim().parse().map_err(|_| invalid())?;
        Self::new(low, high)
    }
}

/// Gain followed by an optional high-pass/low-pass cascade
#[derive(Debug, Clone)]
pub struct Conditioner {
    gain: f32,
    sections: Vec<Biquad>,
}

impl Conditioner {
    pub fn new(gain_db: Option<f32>, band_pass: Option<BandPass>) -> Self {
        let gain = gain_db.map(db_to_gain).unwrap_or(1.0);
        let sample_rate = SAMPLE_RATE as f32;
        let sections = match band_pass {
            Some(band) => vec![
                Biquad::highpass(sample_rate, band.low_hz, BUTTERWORTH_Q),
                Biquad::lowpass(sample_rate, band.high_hz, BUTTERWORTH_Q),
            ],
            None => Vec::new(),
        };
        Self { gain, sections }
    }

    pub fn process(&mut self, sample: f32) -> f32 {
        let mut y = sample * self.gain;
        for section in &mut self.sections {
            y = section.process(y);
        }
        y
    }
}
