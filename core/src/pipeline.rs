//! Shared pieces of the encode and decode flows: options, cancellation and
//! stage tracking

use crate::error::{CodecError, Result};
use crate::filter::BandPass;
use crate::TONE_AMPLITUDE;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared with a running pipeline
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeOptions {
    /// Input gain in dB, applied before tone detection
    pub gain_db: Option<f32>,
    pub band_pass: Option<BandPass>,
    /// Dead band around zero for crossing detection, full scale = 1.0
    pub squelch: Option<f32>,
}

impl DecodeOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(gain) = self.gain_db {
            if !gain.is_finite() {
                return Err(CodecError::InvalidConfig(format!("gain {} dB", gain)));
            }
        }
        if let Some(squelch) = self.squelch {
            if !(0.0..1.0).contains(&squelch) {
                return Err(CodecError::InvalidConfig(format!(
                    "squelch {} outside 0..1",
                    squelch
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeOptions {
    /// Output gain in dB, applied after modulation
    pub gain_db: Option<f32>,
    /// Peak tone level before gain
    pub amplitude: f32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            gain_db: None,
            amplitude: TONE_AMPLITUDE,
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(gain) = self.gain_db {
            if !gain.is_finite() {
                return Err(CodecError::InvalidConfig(format!("gain {} dB", gain)));
            }
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return Err(CodecError::InvalidConfig(format!(
                "amplitude {} outside (0, 1]",
                self.amplitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Reading,
    Demodulating,
    Framing,
    Adapting,
    Modulating,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Reading => "reading",
            Stage::Demodulating => "demodulating",
            Stage::Framing => "framing",
            Stage::Adapting => "adapting",
            Stage::Modulating => "modulating",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Logs stage transitions of one pipeline run
pub(crate) struct StageTracker {
    protocol: &'static str,
    stage: Stage,
}

impl StageTracker {
    pub(crate) fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            stage: Stage::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn enter(&mut self, next: Stage) {
        debug!("{}: {} -> {}", self.protocol, self.stage, next);
        self.stage = next;
    }

    /// Record a fatal error and pass it through
    pub(crate) fn fail(&mut self, error: CodecError) -> CodecError {
        self.enter(Stage::Failed);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_option_validation() {
        assert!(DecodeOptions::default().validate().is_ok());
        let bad = DecodeOptions {
            squelch: Some(1.5),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        assert!(EncodeOptions::default().validate().is_ok());
        let bad = EncodeOptions {
            amplitude: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = EncodeOptions {
            gain_db: Some(f32::NAN),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_stage_tracker() {
        let mut tracker = StageTracker::new("kcs");
        assert_eq!(tracker.stage(), Stage::Idle);
        tracker.enter(Stage::Reading);
        let error = tracker.fail(CodecError::Interrupted);
        assert!(matches!(error, CodecError::Interrupted));
        assert_eq!(tracker.stage(), Stage::Failed);
    }
}
