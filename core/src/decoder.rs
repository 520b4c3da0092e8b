use crate::demod::Demodulator;
use crate::error::{CodecError, Result};
use crate::framing::Framer;
use crate::pipeline::{CancelToken, DecodeOptions, Stage, StageTracker};
use crate::protocol::{Family, ProtocolSpec, TapeProtocol};
use crate::record::{DecodeIssue, Record};
use crate::signal::{from_slice, Cancellable};
use log::{debug, warn};

/// Result of decoding one recording
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeReport {
    pub record: Record,
    pub issues: Vec<DecodeIssue>,
    /// Tape speed relative to nominal, measured on the leader
    pub speed: Option<f32>,
    pub samples_read: u64,
    /// Cancelled before the signal ended; the record is partial
    pub interrupted: bool,
}

impl DecodeReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && !self.interrupted
    }
}

/// Recovers a record from tape audio for one calculator family
pub struct Decoder {
    spec: ProtocolSpec,
    adapter: Box<dyn TapeProtocol>,
    options: DecodeOptions,
}

impl Decoder {
    pub fn new(family: Family) -> Result<Self> {
        Self::with_options(family, DecodeOptions::default())
    }

    pub fn with_options(family: Family, options: DecodeOptions) -> Result<Self> {
        options.validate()?;
        let adapter = family.adapter();
        let spec = adapter.spec().clone();
        spec.validate()?;
        Ok(Self {
            spec,
            adapter,
            options,
        })
    }

    pub fn spec(&self) -> &ProtocolSpec {
        &self.spec
    }

    /// Decode a complete recording held in memory
    pub fn decode(&self, samples: &[f32]) -> Result<DecodeReport> {
        self.decode_stream(from_slice(samples), &CancelToken::new())
    }

    /// Decode from a sample source, stopping early if `cancel` fires
    ///
    /// Damaged bytes do not fail the decode; they show up as placeholders in
    /// the record with a matching issue. Fails with `ProtocolMismatch` when
    /// no leader tone of this family is found at all.
    pub fn decode_stream<I>(&self, source: I, cancel: &CancelToken) -> Result<DecodeReport>
    where
        I: Iterator<Item = Result<f32>>,
    {
        let mut tracker = StageTracker::new(self.spec.name);
        tracker.enter(Stage::Reading);
        let source = Cancellable::new(source, cancel.clone());

        tracker.enter(Stage::Demodulating);
        let demod = Demodulator::new(source, &self.spec, &self.options);

        tracker.enter(Stage::Framing);
        let mut framer = Framer::new(demod, self.spec.frame.clone());

        tracker.enter(Stage::Adapting);
        let decoded = self.adapter.decode(&mut framer);

        let mut demod = framer.into_inner();
        let interrupted = match demod.take_error() {
            None => false,
            Some(CodecError::Interrupted) => {
                warn!(
                    "{}: decode interrupted after {} samples",
                    self.spec.name,
                    demod.samples_read()
                );
                true
            }
            Some(e) => return Err(tracker.fail(e)),
        };

        if !demod.leader_seen() && !interrupted {
            return Err(tracker.fail(CodecError::ProtocolMismatch {
                protocol: self.spec.name,
                samples: demod.samples_read(),
            }));
        }

        debug!(
            "{}: {} bytes, {} damaged, {} issue(s)",
            self.spec.name,
            decoded.record.len(),
            decoded.record.damaged(),
            decoded.issues.len()
        );
        tracker.enter(Stage::Done);
        Ok(DecodeReport {
            record: decoded.record,
            issues: decoded.issues,
            speed: demod.speed(),
            samples_read: demod.samples_read(),
            interrupted,
        })
    }
}
