//! Byte framing on top of a recovered bit clock
//!
//! Decoding pulls cells from a `BitSource` and checks start, parity and stop
//! slots; encoding expands bytes and carrier gaps into tones.

use crate::error::{CodecError, Result};
use crate::modulator::Tone;
use crate::protocol::{FrameShape, Slot};
use crate::{DROPOUT_MIN_CELLS, SAMPLE_RATE};
use log::debug;
use std::collections::VecDeque;
use thiserror::Error;

/// One demodulated bit cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCell {
    /// `None` when neither tone was recognized
    pub value: Option<bool>,
    pub start: u64,
    pub len: u32,
}

/// A start bit found by hunting forward from the current clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartBit {
    pub cell: BitCell,
    /// Longest stretch of unrecognizable signal passed while hunting, in cells
    pub dropout_cells: f32,
    /// Clock lock was lost and a new leader acquired on the way
    pub relocked: bool,
}

pub trait BitSource {
    /// Hunt for the next start bit; `None` once the signal ends
    fn seek_start(&mut self) -> Option<StartBit>;

    /// The cell following the previous one on the current clock
    fn next_cell(&mut self) -> Option<BitCell>;
}

/// Bit source over already-sliced cell levels
pub struct BitStream<I> {
    levels: I,
    cell_len: u32,
    position: u64,
}

pub fn bit_stream<I>(levels: I, cell_len: u32) -> BitStream<I::IntoIter>
where
    I: IntoIterator<Item = Option<bool>>,
{
    BitStream {
        levels: levels.into_iter(),
        cell_len,
        position: 0,
    }
}

impl<I: Iterator<Item = Option<bool>>> BitSource for BitStream<I> {
    fn seek_start(&mut self) -> Option<StartBit> {
        let mut run = 0u32;
        let mut longest = 0u32;
        loop {
            let cell = self.next_cell()?;
            match cell.value {
                Some(false) => {
                    return Some(StartBit {
                        cell,
                        dropout_cells: longest as f32,
                        relocked: false,
                    })
                }
                Some(true) => run = 0,
                None => {
                    run += 1;
                    longest = longest.max(run);
                }
            }
        }
    }

    fn next_cell(&mut self) -> Option<BitCell> {
        let value = self.levels.next()?;
        let cell = BitCell {
            value,
            start: self.position,
            len: self.cell_len,
        };
        self.position += self.cell_len as u64;
        Some(cell)
    }
}

/// A successfully framed byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub byte: u8,
    /// Sample index of the start bit
    pub position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    Parity,
    StopBit,
    /// A cell matched neither tone
    Ambiguous,
    /// An inner start bit was not where the clock predicted
    MissingStart,
    /// Signal ended inside the frame
    Truncated,
    /// Signal lost between frames, a byte is presumed missing
    Dropout,
}

impl std::fmt::Display for FrameFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FrameFault::Parity => "parity error",
            FrameFault::StopBit => "bad stop bit",
            FrameFault::Ambiguous => "unrecognized tone",
            FrameFault::MissingStart => "missing start bit",
            FrameFault::Truncated => "frame cut short",
            FrameFault::Dropout => "signal dropout",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{fault} at sample {position}")]
pub struct FrameError {
    pub position: u64,
    pub fault: FrameFault,
}

pub type FrameResult = std::result::Result<Frame, FrameError>;

/// Groups a bit source into bytes, resynchronizing on every start bit
pub struct Framer<B> {
    source: B,
    shape: FrameShape,
    pending_start: Option<StartBit>,
    pending_errors: VecDeque<FrameError>,
}

impl<B: BitSource> Framer<B> {
    pub fn new(source: B, shape: FrameShape) -> Self {
        Self {
            source,
            shape,
            pending_start: None,
            pending_errors: VecDeque::new(),
        }
    }

    pub fn into_inner(self) -> B {
        self.source
    }

    fn lost_frames(&self, start: &StartBit) -> usize {
        if start.relocked || start.dropout_cells < DROPOUT_MIN_CELLS {
            return 0;
        }
        let frames = (start.dropout_cells / self.shape.cells() as f32).round() as usize;
        frames.max(1)
    }

    fn read_frame(&mut self, start: StartBit) -> FrameResult {
        let position = start.cell.start;
        let cell_len = start.cell.len as u64;
        let mut predicted = start.cell.start + cell_len;
        let mut fault: Option<FrameFault> = None;
        let mut byte = 0u8;
        let mut ones = 0u32;

        for &slot in self.shape.slots().iter().skip(1) {
            if slot == Slot::Start {
                let Some(next) = self.source.seek_start() else {
                    fault = fault.or(Some(FrameFault::Truncated));
                    break;
                };
                if next.relocked || next.cell.start.abs_diff(predicted) > cell_len {
                    // frame boundary, the next frame begins on this start bit
                    self.pending_start = Some(next);
                    fault = fault.or(Some(FrameFault::MissingStart));
                    break;
                }
                predicted = next.cell.start + next.cell.len as u64;
                continue;
            }

            let Some(cell) = self.source.next_cell() else {
                fault = fault.or(Some(FrameFault::Truncated));
                break;
            };
            predicted = cell.start + cell.len as u64;
            let Some(level) = cell.value else {
                fault = fault.or(Some(FrameFault::Ambiguous));
                continue;
            };
            match slot {
                Slot::Data(n) => {
                    if level {
                        byte |= 1 << n;
                        ones += 1;
                    }
                }
                Slot::Parity => {
                    if self.shape.parity().bit(ones) != Some(level) {
                        fault = fault.or(Some(FrameFault::Parity));
                    }
                }
                Slot::Stop => {
                    if !level {
                        fault = fault.or(Some(FrameFault::StopBit));
                    }
                }
                Slot::Start => {}
            }
        }

        match fault {
            None => Ok(Frame { byte, position }),
            Some(fault) => Err(FrameError { position, fault }),
        }
    }
}

impl<B: BitSource> Iterator for Framer<B> {
    type Item = FrameResult;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.pending_errors.pop_front() {
            return Some(Err(error));
        }

        let start = match self.pending_start.take() {
            Some(start) => start,
            None => {
                let start = self.source.seek_start()?;
                let lost = self.lost_frames(&start);
                if lost > 0 {
                    let gap = (start.dropout_cells * start.cell.len as f32) as u64;
                    let position = start.cell.start.saturating_sub(gap);
                    debug!(
                        "dropout of {:.1} cells before sample {}, {} frame(s) lost",
                        start.dropout_cells, start.cell.start, lost
                    );
                    self.pending_errors.extend(
                        std::iter::repeat(FrameError {
                            position,
                            fault: FrameFault::Dropout,
                        })
                        .take(lost),
                    );
                    self.pending_start = Some(start);
                    return self.pending_errors.pop_front().map(Err);
                }
                start
            }
        };

        Some(self.read_frame(start))
    }
}

/// What goes on tape between leader and trailer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TapeItem {
    Byte(u8),
    /// Mark carrier gap in seconds
    Carrier(f32),
}

pub fn secs_to_samples(secs: f32) -> u64 {
    (secs as f64 * SAMPLE_RATE as f64).round() as u64
}

/// Expand tape items into tones, one group per item
///
/// Everything is checked up front so nothing is emitted for a bad record.
pub fn frame_items(shape: &FrameShape, items: &[TapeItem]) -> Result<Vec<Vec<Tone>>> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| match *item {
            TapeItem::Byte(byte) => {
                if !shape.fits(byte) {
                    return Err(CodecError::unsupported(
                        index,
                        format!(
                            "value {:#04x} does not fit data mask {:#04x}",
                            byte,
                            shape.data_mask()
                        ),
                    ));
                }
                Ok(shape.bits(byte).into_iter().map(Tone::Bit).collect())
            }
            TapeItem::Carrier(secs) => {
                if !(secs.is_finite() && secs >= 0.0) {
                    return Err(CodecError::InvalidConfig(format!(
                        "carrier gap of {} s at item {}",
                        secs, index
                    )));
                }
                Ok(vec![Tone::Carrier(secs_to_samples(secs))])
            }
        })
        .collect()
}
