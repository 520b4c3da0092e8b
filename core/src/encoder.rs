use crate::error::{CodecError, Result};
use crate::framing::frame_items;
use crate::modulator::{self, Modulator, Tone};
use crate::pipeline::{CancelToken, EncodeOptions, Stage, StageTracker};
use crate::protocol::{Family, ProtocolSpec, TapeProtocol};
use crate::record::Record;
use crate::signal::{db_to_gain, SampleSink};
use log::debug;

/// Turns a record into tape audio for one calculator family
///
/// Output: leader carrier + framed bytes (with any protocol carrier gaps)
/// + trailer carrier + silence, mono at `SAMPLE_RATE`.
pub struct Encoder {
    spec: ProtocolSpec,
    adapter: Box<dyn TapeProtocol>,
    options: EncodeOptions,
}

impl Encoder {
    pub fn new(family: Family) -> Result<Self> {
        Self::with_options(family, EncodeOptions::default())
    }

    pub fn with_options(family: Family, options: EncodeOptions) -> Result<Self> {
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

    /// Encode a record into a sample buffer
    pub fn encode(&self, record: &Record) -> Result<Vec<f32>> {
        let mut samples = Vec::new();
        self.encode_to(record, &mut samples, &CancelToken::new())?;
        Ok(samples)
    }

    /// Stream a record into a sink, checking for cancellation between bytes
    ///
    /// The record is validated and framed completely before the first sample
    /// is written. On cancellation the sink is finished and `Interrupted`
    /// returned.
    pub fn encode_to(
        &self,
        record: &Record,
        sink: &mut dyn SampleSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut tracker = StageTracker::new(self.spec.name);

        tracker.enter(Stage::Adapting);
        let items = self.adapter.encode(record).map_err(|e| tracker.fail(e))?;

        tracker.enter(Stage::Framing);
        let groups = frame_items(&self.spec.frame, &items).map_err(|e| tracker.fail(e))?;
        debug!(
            "{}: {} record bytes became {} tape items",
            self.spec.name,
            record.len(),
            items.len()
        );

        tracker.enter(Stage::Modulating);
        let gain = self.options.gain_db.map(db_to_gain).unwrap_or(1.0);
        let mut modulator = Modulator::new(&self.spec, self.options.amplitude);
        let mut buffer = Vec::new();

        emit(&mut modulator, &[modulator::leader(&self.spec)], gain, &mut buffer, sink)
            .map_err(|e| tracker.fail(e))?;
        for group in &groups {
            if cancel.is_cancelled() {
                debug!("{}: cancelled after {} samples", self.spec.name, modulator.emitted());
                sink.finish().map_err(|e| tracker.fail(e))?;
                return Err(tracker.fail(CodecError::Interrupted));
            }
            emit(&mut modulator, group, gain, &mut buffer, sink).map_err(|e| tracker.fail(e))?;
        }
        emit(&mut modulator, &modulator::trailer(&self.spec), gain, &mut buffer, sink)
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(Stage::Writing);
        sink.finish().map_err(|e| tracker.fail(e))?;
        tracker.enter(Stage::Done);
        Ok(())
    }
}

fn emit(
    modulator: &mut Modulator,
    tones: &[Tone],
    gain: f32,
    buffer: &mut Vec<f32>,
    sink: &mut dyn SampleSink,
) -> Result<()> {
    buffer.clear();
    modulator.render(tones, buffer);
    if gain != 1.0 {
        buffer.iter_mut().for_each(|s| *s *= gain);
    }
    sink.write(buffer)
}
