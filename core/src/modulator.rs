use crate::framing::secs_to_samples;
use crate::protocol::ProtocolSpec;
use crate::SAMPLE_RATE;
use std::f64::consts::TAU;

/// Line signal for a stretch of tape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// One bit cell, mark when true
    Bit(bool),
    /// Mark carrier for a number of samples
    Carrier(u64),
    /// Silence for a number of samples; the oscillator restarts at zero phase
    Silence(u64),
}

/// Continuous-phase two-tone oscillator
///
/// Bit cell `k` covers samples `[round(k * L), round((k + 1) * L))` of the
/// running clock, so fractional cell lengths do not accumulate drift.
pub struct Modulator {
    mark_step: f64,
    space_step: f64,
    cell_len: f64,
    amplitude: f32,
    phase: f64,
    clock: f64,
    emitted: u64,
}

impl Modulator {
    pub fn new(spec: &ProtocolSpec, amplitude: f32) -> Self {
        Self {
            mark_step: TAU * spec.mark_hz as f64 / SAMPLE_RATE as f64,
            space_step: TAU * spec.space_hz as f64 / SAMPLE_RATE as f64,
            cell_len: spec.samples_per_cell(),
            amplitude,
            phase: 0.0,
            clock: 0.0,
            emitted: 0,
        }
    }

    /// Samples produced so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn oscillate(&mut self, step: f64, count: u64, out: &mut Vec<f32>) {
        out.reserve(count as usize);
        for _ in 0..count {
            out.push(self.amplitude * self.phase.sin() as f32);
            self.phase = (self.phase + step) % TAU;
        }
        self.emitted += count;
    }

    pub fn render(&mut self, tones: &[Tone], out: &mut Vec<f32>) {
        for &tone in tones {
            match tone {
                Tone::Bit(mark) => {
                    let end = (self.clock + self.cell_len).round() as u64;
                    let count = end.saturating_sub(self.emitted);
                    let step = if mark { self.mark_step } else { self.space_step };
                    self.oscillate(step, count, out);
                    self.clock += self.cell_len;
                }
                Tone::Carrier(samples) => {
                    self.oscillate(self.mark_step, samples, out);
                    self.clock += samples as f64;
                }
                Tone::Silence(samples) => {
                    out.resize(out.len() + samples as usize, 0.0);
                    self.phase = 0.0;
                    self.emitted += samples;
                    self.clock += samples as f64;
                }
            }
        }
    }
}

pub fn leader(spec: &ProtocolSpec) -> Tone {
    Tone::Carrier(secs_to_samples(spec.leader_secs))
}

pub fn trailer(spec: &ProtocolSpec) -> [Tone; 2] {
    [
        Tone::Carrier(secs_to_samples(spec.trailer_secs)),
        Tone::Silence(secs_to_samples(spec.silence_secs)),
    ]
}

/// Leader, the given tones, then trailer and silence, as one buffer
pub fn modulate(spec: &ProtocolSpec, tones: &[Tone], amplitude: f32) -> Vec<f32> {
    let mut modulator = Modulator::new(spec, amplitude);
    let mut out = Vec::new();
    modulator.render(&[leader(spec)], &mut out);
    modulator.render(tones, &mut out);
    modulator.render(&trailer(spec), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TONE_AMPLITUDE;

    fn sign_changes(samples: &[f32]) -> usize {
        let mut last = None;
        let mut changes = 0;
        for &s in samples.iter().filter(|s| s.abs() >= 1e-3) {
            let positive = s > 0.0;
            if last.is_some_and(|l| l != positive) {
                changes += 1;
            }
            last = Some(positive);
        }
        changes
    }

    #[test]
    fn test_cell_lengths_and_cycles() {
        let spec = ProtocolSpec::kcs();
        let mut modulator = Modulator::new(&spec, TONE_AMPLITUDE);
        let mut out = Vec::new();
        modulator.render(&[Tone::Bit(true), Tone::Bit(false)], &mut out);
        assert_eq!(out.len(), 320);
        // 4 cycles of 1200 Hz, then 8 cycles of 2400 Hz
        let mark_changes = sign_changes(&out[..161]);
        let space_changes = sign_changes(&out[159..]);
        assert!((7..=8).contains(&mark_changes), "{}", mark_changes);
        assert!((15..=16).contains(&space_changes), "{}", space_changes);
    }

    #[test]
    fn test_phase_continuous_across_cells() {
        let spec = ProtocolSpec::casio_fx502p();
        let mut modulator = Modulator::new(&spec, TONE_AMPLITUDE);
        let mut out = Vec::new();
        let tones: Vec<Tone> = [true, false, false, true, false, true, true]
            .into_iter()
            .map(Tone::Bit)
            .collect();
        modulator.render(&tones, &mut out);
        // largest sample-to-sample jump of the faster tone bounds every step
        let max_step = TAU * 2400.0 / SAMPLE_RATE as f64 * TONE_AMPLITUDE as f64;
        for pair in out.windows(2) {
            assert!(((pair[1] - pair[0]).abs() as f64) <= max_step + 1e-4);
        }
    }

    #[test]
    fn test_amplitude_bound() {
        let spec = ProtocolSpec::sharp_pc1211();
        let out = modulate(&spec, &[Tone::Bit(false), Tone::Bit(true)], 0.5);
        assert!(out.iter().all(|s| s.abs() <= 0.5 + 1e-6));
        let peak = out.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.45);
    }

    #[test]
    fn test_leader_and_trailer_lengths() {
        let spec = ProtocolSpec::kcs();
        let out = modulate(&spec, &[Tone::Bit(false)], TONE_AMPLITUDE);
        let expected = 48000 + 160 + 12000 + 4800;
        assert_eq!(out.len(), expected);
        assert!(out[out.len() - 4800..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_deterministic_output() {
        let spec = ProtocolSpec::kcs();
        let tones: Vec<Tone> = spec.frame.bits(0x5A).into_iter().map(Tone::Bit).collect();
        let a = modulate(&spec, &tones, TONE_AMPLITUDE);
        let b = modulate(&spec, &tones, TONE_AMPLITUDE);
        assert_eq!(a, b);
    }
}
