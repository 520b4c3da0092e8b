//! Per-family tape parameters and the adapter interface
//!
//! A `ProtocolSpec` holds everything the analog layer needs: the two tones,
//! the bit rate, the on-wire frame shape and the leader/trailer lengths.
//! Block structure and checksums live in the `TapeProtocol` adapters.

use crate::casio_fx502p::CasioFx502p;
use crate::error::{CodecError, Result};
use crate::framing::{FrameResult, TapeItem};
use crate::kcs::Kcs;
use crate::record::{Decoded, Record};
use crate::sharp_pc1211::SharpPc1211;
use crate::{LEADER_DETECT_MS, SAMPLE_RATE};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    /// Parity bit to transmit for a frame carrying `ones` set data bits
    pub fn bit(self, ones: u32) -> Option<bool> {
        match self {
            Parity::None => None,
            Parity::Even => Some(ones % 2 == 1),
            Parity::Odd => Some(ones % 2 == 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

/// One bit cell position inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Space tone, marks the start of a frame or sub-frame
    Start,
    /// Data bit `n` of the byte (0 = LSB)
    Data(u8),
    Parity,
    /// Mark tone
    Stop,
}

/// Ordered bit cells making up one byte on tape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameShape {
    slots: Vec<Slot>,
    parity: Parity,
}

impl FrameShape {
    /// Classic asynchronous serial frame: start, data, optional parity, stops
    pub fn uart(data_bits: u8, parity: Parity, stop_bits: u8, order: BitOrder) -> Result<Self> {
        if data_bits == 0 || data_bits > 8 {
            return Err(CodecError::InvalidConfig(format!(
                "{} data bits per frame, expected 1..=8",
                data_bits
            )));
        }
        let mut slots = vec![Slot::Start];
        match order {
            BitOrder::LsbFirst => slots.extend((0..data_bits).map(Slot::Data)),
            BitOrder::MsbFirst => slots.extend((0..data_bits).rev().map(Slot::Data)),
        }
        if parity != Parity::None {
            slots.push(Slot::Parity);
        }
        slots.extend(std::iter::repeat(Slot::Stop).take(stop_bits as usize));
        Self::from_slots(slots, parity)
    }

    /// Parse a slot pattern such as `S4567----S0123-----`
    ///
    /// `S` start bit, `0`-`7` data bit, `P` parity bit, `-` stop bit.
    pub fn from_pattern(pattern: &str, parity: Parity) -> Result<Self> {
        let slots = pattern
            .chars()
            .map(|c| match c {
                'S' => Ok(Slot::Start),
                'P' => Ok(Slot::Parity),
                '-' => Ok(Slot::Stop),
                '0'..='7' => Ok(Slot::Data(c as u8 - b'0')),
                other => Err(CodecError::InvalidConfig(format!(
                    "unknown slot '{}' in frame pattern '{}'",
                    other, pattern
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_slots(slots, parity)
    }

    fn from_slots(slots: Vec<Slot>, parity: Parity) -> Result<Self> {
        if slots.first() != Some(&Slot::Start) {
            return Err(CodecError::InvalidConfig(
                "frame must begin with a start bit".into(),
            ));
        }
        let mut seen = 0u8;
        for slot in &slots {
            if let Slot::Data(n) = slot {
                if seen & (1 << n) != 0 {
                    return Err(CodecError::InvalidConfig(format!(
                        "data bit {} appears twice in frame",
                        n
                    )));
                }
                seen |= 1 << n;
            }
        }
        if seen == 0 {
            return Err(CodecError::InvalidConfig("frame carries no data bits".into()));
        }
        let has_parity_slot = slots.contains(&Slot::Parity);
        if has_parity_slot != (parity != Parity::None) {
            return Err(CodecError::InvalidConfig(
                "parity slot and parity rule disagree".into(),
            ));
        }
        Ok(Self { slots, parity })
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Bit cells per byte
    pub fn cells(&self) -> usize {
        self.slots.len()
    }

    /// Byte values this frame can carry
    pub fn data_mask(&self) -> u8 {
        self.slots.iter().fold(0u8, |mask, slot| match slot {
            Slot::Data(n) => mask | (1 << n),
            _ => mask,
        })
    }

    pub fn fits(&self, byte: u8) -> bool {
        byte & !self.data_mask() == 0
    }

    /// Line levels for one byte, true = mark
    ///
    /// Parity covers the data bits sent before the parity slot.
    pub fn bits(&self, byte: u8) -> Vec<bool> {
        let mut ones = 0u32;
        self.slots
            .iter()
            .map(|slot| match *slot {
                Slot::Start => false,
                Slot::Stop => true,
                Slot::Data(n) => {
                    let bit = byte & (1 << n) != 0;
                    ones += bit as u32;
                    bit
                }
                Slot::Parity => self.parity.bit(ones).unwrap_or(true),
            })
            .collect()
    }
}

/// Immutable timing and framing parameters for one calculator family
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSpec {
    pub name: &'static str,
    /// Tone for bit value 1, also the leader and trailer carrier
    pub mark_hz: f32,
    /// Tone for bit value 0
    pub space_hz: f32,
    pub baud: f32,
    pub frame: FrameShape,
    pub leader_secs: f32,
    pub trailer_secs: f32,
    pub silence_secs: f32,
}

impl ProtocolSpec {
    /// Kansas City Standard, 300 baud 8-N-1
    pub fn kcs() -> Self {
        Self {
            name: "kcs",
            mark_hz: 1200.0,
            space_hz: 2400.0,
            baud: 300.0,
            frame: FrameShape {
                slots: std::iter::once(Slot::Start)
                    .chain((0..8).map(Slot::Data))
                    .chain(std::iter::once(Slot::Stop))
                    .collect(),
                parity: Parity::None,
            },
            leader_secs: 1.0,
            trailer_secs: 0.25,
            silence_secs: 0.1,
        }
    }

    /// Casio FX-502P cassette interface, 300 baud 8-E-2
    pub fn casio_fx502p() -> Self {
        Self {
            name: "fx502p",
            mark_hz: 2400.0,
            space_hz: 1200.0,
            baud: 300.0,
            frame: FrameShape {
                slots: std::iter::once(Slot::Start)
                    .chain((0..8).map(Slot::Data))
                    .chain([Slot::Parity, Slot::Stop, Slot::Stop])
                    .collect(),
                parity: Parity::Even,
            },
            leader_secs: 4.0,
            trailer_secs: 0.1,
            silence_secs: 0.1,
        }
    }

    /// Sharp PC-1211 / TRS-80 PC-1, 500 baud, each byte as two nibble frames
    pub fn sharp_pc1211() -> Self {
        Self {
            name: "pc1211",
            mark_hz: 4000.0,
            space_hz: 2000.0,
            baud: 500.0,
            frame: FrameShape {
                // S4567----S0123-----
                slots: std::iter::once(Slot::Start)
                    .chain((4..8).map(Slot::Data))
                    .chain([Slot::Stop; 4])
                    .chain(std::iter::once(Slot::Start))
                    .chain((0..4).map(Slot::Data))
                    .chain([Slot::Stop; 5])
                    .collect(),
                parity: Parity::None,
            },
            leader_secs: 4.0,
            trailer_secs: 0.5,
            silence_secs: 0.1,
        }
    }

    /// Nominal bit cell length in samples
    pub fn samples_per_cell(&self) -> f64 {
        SAMPLE_RATE as f64 / self.baud as f64
    }

    /// Zero crossings a tone produces in one bit cell
    pub fn crossings_per_cell(&self, tone_hz: f32) -> f32 {
        2.0 * tone_hz / self.baud
    }

    pub fn validate(&self) -> Result<()> {
        let nyquist = SAMPLE_RATE as f32 / 2.0;
        for (label, hz) in [("mark", self.mark_hz), ("space", self.space_hz)] {
            if !(hz > 0.0 && hz < nyquist) {
                return Err(CodecError::InvalidConfig(format!(
                    "{}: {} tone {} Hz outside 0..{} Hz",
                    self.name, label, hz, nyquist
                )));
            }
            let cycles = hz / self.baud;
            if (cycles - cycles.round()).abs() > 1e-3 || cycles.round() < 1.0 {
                return Err(CodecError::InvalidConfig(format!(
                    "{}: {} tone {} Hz is not a whole number of cycles per bit at {} baud",
                    self.name, label, hz, self.baud
                )));
            }
        }
        if self.mark_hz == self.space_hz {
            return Err(CodecError::InvalidConfig(format!(
                "{}: mark and space tones coincide",
                self.name
            )));
        }
        if self.leader_secs * 1000.0 < LEADER_DETECT_MS as f32 {
            return Err(CodecError::InvalidConfig(format!(
                "{}: {} s leader is shorter than the {} ms lock window",
                self.name, self.leader_secs, LEADER_DETECT_MS
            )));
        }
        if self.trailer_secs < 0.0 || self.silence_secs < 0.0 {
            return Err(CodecError::InvalidConfig(format!(
                "{}: negative trailer length",
                self.name
            )));
        }
        Ok(())
    }
}

/// Translates between framed bytes and a calculator's block structure
pub trait TapeProtocol: Send + Sync {
    fn spec(&self) -> &ProtocolSpec;

    /// Best-effort decode; stops pulling frames at the block terminator
    fn decode(&self, frames: &mut dyn Iterator<Item = FrameResult>) -> Decoded;

    /// Bytes and carrier gaps to put on tape, strict about unrepresentable input
    fn encode(&self, record: &Record) -> Result<Vec<TapeItem>>;
}

/// Supported calculator families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Kcs,
    CasioFx502p,
    SharpPc1211,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Kcs, Family::CasioFx502p, Family::SharpPc1211];

    pub fn name(self) -> &'static str {
        match self {
            Family::Kcs => "kcs",
            Family::CasioFx502p => "fx502p",
            Family::SharpPc1211 => "pc1211",
        }
    }

    pub fn spec(self) -> ProtocolSpec {
        match self {
            Family::Kcs => ProtocolSpec::kcs(),
            Family::CasioFx502p => ProtocolSpec::casio_fx502p(),
            Family::SharpPc1211 => ProtocolSpec::sharp_pc1211(),
        }
    }

    pub fn adapter(self) -> Box<dyn TapeProtocol> {
        match self {
            Family::Kcs => Box::new(Kcs::new()),
            Family::CasioFx502p => Box::new(CasioFx502p::new()),
            Family::SharpPc1211 => Box::new(SharpPc1211::new()),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Family::ALL
            .into_iter()
            .find(|family| family.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Family::ALL.iter().map(|f| f.name()).collect();
                CodecError::InvalidConfig(format!(
                    "unknown protocol '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}
