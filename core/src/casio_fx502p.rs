//! Casio FX-502P cassette interface
//!
//! A block is a two-byte BCD header sent low byte first (`0xBnnn` for
//! program `nnn`, `0xFnnn` for a memory dump), the body, and a run of 0xFF
//! end markers.

use crate::error::{CodecError, Result};
use crate::framing::{FrameError, FrameResult, TapeItem};
use crate::protocol::{ProtocolSpec, TapeProtocol};
use crate::record::{DecodeIssue, Decoded, Record, RecordKind};
use log::debug;

pub const END_MARKER: u8 = 0xFF;
/// End markers appended on encode
pub const END_MARKER_COUNT: usize = 128;
/// 22 registers of 8 bytes each
pub const MEMORY_BYTES: usize = 176;

const PROGRAM_NIBBLE: u8 = 0xB;
const MEMORY_NIBBLE: u8 = 0xF;

fn is_bcd(byte: u8) -> bool {
    byte >> 4 <= 9 && byte & 0x0F <= 9
}

/// Block kind announced by a header pair, if it is one
pub fn header_kind(lo: u8, hi: u8) -> Option<RecordKind> {
    if !is_bcd(lo) || hi & 0x0F > 9 {
        return None;
    }
    match hi >> 4 {
        PROGRAM_NIBBLE => Some(RecordKind::Program),
        MEMORY_NIBBLE => Some(RecordKind::Memory),
        _ => None,
    }
}

fn header(kind_nibble: u8, number: u16) -> Result<[u8; 2]> {
    if number > 999 {
        return Err(CodecError::InvalidConfig(format!(
            "block number {} needs more than three digits",
            number
        )));
    }
    let hundreds = (number / 100) as u8;
    let tens = (number / 10 % 10) as u8;
    let ones = (number % 10) as u8;
    Ok([tens << 4 | ones, kind_nibble << 4 | hundreds])
}

/// Header bytes for program `number`, in tape order
pub fn program_header(number: u16) -> Result<[u8; 2]> {
    header(PROGRAM_NIBBLE, number)
}

/// Header bytes for memory dump `number`, in tape order
pub fn memory_header(number: u16) -> Result<[u8; 2]> {
    header(MEMORY_NIBBLE, number)
}

pub struct CasioFx502p {
    spec: ProtocolSpec,
}

impl CasioFx502p {
    pub fn new() -> Self {
        Self {
            spec: ProtocolSpec::casio_fx502p(),
        }
    }
}

impl Default for CasioFx502p {
    fn default() -> Self {
        Self::new()
    }
}

impl TapeProtocol for CasioFx502p {
    fn spec(&self) -> &ProtocolSpec {
        &self.spec
    }

    fn decode(&self, frames: &mut dyn Iterator<Item = FrameResult>) -> Decoded {
        // everything seen while looking for the header, kept in case none shows up
        let mut skipped: Vec<Option<u8>> = Vec::new();
        let mut skipped_errors: Vec<(usize, FrameError)> = Vec::new();
        let mut previous: Option<u8> = None;
        let mut kind = None;

        for frame in &mut *frames {
            match frame {
                Ok(frame) => {
                    skipped.push(Some(frame.byte));
                    if let Some(lo) = previous {
                        if let Some(found) = header_kind(lo, frame.byte) {
                            debug!(
                                "{} header {:02X}{:02X} at sample {}",
                                found.name(),
                                frame.byte,
                                lo,
                                frame.position
                            );
                            kind = Some((found, lo, frame.byte));
                            break;
                        }
                    }
                    previous = Some(frame.byte);
                }
                Err(error) => {
                    skipped_errors.push((skipped.len(), error));
                    skipped.push(None);
                    previous = None;
                }
            }
        }

        let Some((kind, lo, hi)) = kind else {
            let mut issues: Vec<DecodeIssue> = skipped_errors
                .into_iter()
                .map(|(index, error)| DecodeIssue::Frame {
                    index: Some(index),
                    error,
                })
                .collect();
            issues.push(DecodeIssue::MissingHeader);
            return Decoded {
                record: Record {
                    kind: RecordKind::Raw,
                    bytes: skipped,
                },
                issues,
            };
        };

        // damage before the header is noise on the leader, not record content
        let mut issues: Vec<DecodeIssue> = skipped_errors
            .into_iter()
            .map(|(_, error)| DecodeIssue::Frame { index: None, error })
            .collect();
        let mut record = Record::new(kind, &[lo, hi]);
        let mut terminated = false;

        for frame in frames {
            match frame {
                Ok(frame) if frame.byte == END_MARKER => {
                    terminated = true;
                    break;
                }
                Ok(frame) => record.bytes.push(Some(frame.byte)),
                Err(error) => {
                    issues.push(DecodeIssue::Frame {
                        index: Some(record.len()),
                        error,
                    });
                    record.bytes.push(None);
                }
            }
        }

        if !terminated {
            issues.push(DecodeIssue::MissingTerminator);
        }
        Decoded { record, issues }
    }

    fn encode(&self, record: &Record) -> Result<Vec<TapeItem>> {
        let bytes = record.intact_bytes()?;
        let (header, body) = match bytes.as_slice() {
            [lo, hi, body @ ..] => ([*lo, *hi], body),
            _ => {
                return Err(CodecError::unsupported(
                    bytes.len(),
                    "block header needs two bytes",
                ))
            }
        };
        let kind = header_kind(header[0], header[1]).ok_or_else(|| {
            CodecError::unsupported(
                0,
                format!("{:02X}{:02X} is not a block header", header[1], header[0]),
            )
        })?;
        if record.kind != RecordKind::Raw && record.kind != kind {
            return Err(CodecError::unsupported(
                1,
                format!(
                    "header announces a {} block but the record is a {}",
                    kind.name(),
                    record.kind.name()
                ),
            ));
        }
        if let Some(offset) = body.iter().position(|&b| b == END_MARKER) {
            return Err(CodecError::unsupported(
                offset + 2,
                "0xFF would end the block early",
            ));
        }
        if kind == RecordKind::Memory && body.len() != MEMORY_BYTES {
            return Err(CodecError::unsupported(
                2 + body.len().min(MEMORY_BYTES),
                format!(
                    "memory dump has {} bytes, expected {}",
                    body.len(),
                    MEMORY_BYTES
                ),
            ));
        }

        Ok(bytes
            .into_iter()
            .chain(std::iter::repeat(END_MARKER).take(END_MARKER_COUNT))
            .map(TapeItem::Byte)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Frame, FrameFault};

    fn frames(bytes: &[u8]) -> Vec<FrameResult> {
        bytes
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                Ok(Frame {
                    byte,
                    position: i as u64 * 1920,
                })
            })
            .collect()
    }

    fn decode(frames: Vec<FrameResult>) -> Decoded {
        CasioFx502p::new().decode(&mut frames.into_iter())
    }

    #[test]
    fn test_headers_are_bcd_low_byte_first() {
        assert_eq!(program_header(123).unwrap(), [0x23, 0xB1]);
        assert_eq!(memory_header(7).unwrap(), [0x07, 0xF0]);
        assert!(program_header(1000).is_err());
        assert_eq!(header_kind(0x23, 0xB1), Some(RecordKind::Program));
        assert_eq!(header_kind(0x2A, 0xB1), None);
        assert_eq!(header_kind(0xFF, 0xFF), None);
        assert_eq!(header_kind(0x00, 0xC0), None);
    }

    #[test]
    fn test_decode_skips_noise_before_header() {
        let decoded = decode(frames(&[0x7E, 0x01, 0x23, 0xB1, 0x10, 0x20, 0xFF, 0xFF]));
        assert!(decoded.is_clean(), "{:?}", decoded.issues);
        assert_eq!(decoded.record.kind, RecordKind::Program);
        assert_eq!(
            decoded.record.bytes,
            vec![Some(0x23), Some(0xB1), Some(0x10), Some(0x20)]
        );
    }

    #[test]
    fn test_decode_memory_dump() {
        let mut bytes = memory_header(0).unwrap().to_vec();
        bytes.extend(std::iter::repeat(0x00).take(MEMORY_BYTES));
        bytes.push(0xFF);
        let decoded = decode(frames(&bytes));
        assert!(decoded.is_clean());
        assert_eq!(decoded.record.kind, RecordKind::Memory);
        assert_eq!(decoded.record.len(), MEMORY_BYTES + 2);
    }

    #[test]
    fn test_decode_without_header_returns_raw() {
        let decoded = decode(frames(&[0x01, 0x02, 0x03]));
        assert_eq!(decoded.record.kind, RecordKind::Raw);
        assert_eq!(decoded.record.bytes, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(decoded.issues, vec![DecodeIssue::MissingHeader]);
    }

    #[test]
    fn test_decode_reports_missing_terminator_and_damage() {
        let mut input = frames(&[0x00, 0xB0, 0x41, 0x42]);
        input.insert(
            3,
            Err(FrameError {
                position: 5760,
                fault: FrameFault::Parity,
            }),
        );
        let decoded = decode(input);
        assert_eq!(
            decoded.record.bytes,
            vec![Some(0x00), Some(0xB0), Some(0x41), None, Some(0x42)]
        );
        assert!(matches!(
            decoded.issues[0],
            DecodeIssue::Frame { index: Some(3), .. }
        ));
        assert_eq!(decoded.issues[1], DecodeIssue::MissingTerminator);
    }

    #[test]
    fn test_encode_appends_end_markers() {
        let mut bytes = program_header(1).unwrap().to_vec();
        bytes.extend([0x10, 0x20]);
        let items = CasioFx502p::new()
            .encode(&Record::new(RecordKind::Program, &bytes))
            .unwrap();
        assert_eq!(items.len(), 4 + END_MARKER_COUNT);
        assert_eq!(items[1], TapeItem::Byte(0xB0));
        assert!(items[4..].iter().all(|&i| i == TapeItem::Byte(0xFF)));
    }

    #[test]
    fn test_encode_rejections() {
        let adapter = CasioFx502p::new();
        let reject = |kind, bytes: &[u8]| -> usize {
            match adapter.encode(&Record::new(kind, bytes)) {
                Err(CodecError::UnsupportedRecord { index, .. }) => index,
                other => panic!("expected UnsupportedRecord, got {:?}", other),
            }
        };

        assert_eq!(reject(RecordKind::Program, &[0x01]), 1);
        assert_eq!(reject(RecordKind::Program, &[0x01, 0x02, 0x03]), 0);
        // memory header on a program record
        assert_eq!(reject(RecordKind::Program, &[0x00, 0xF0]), 1);
        assert_eq!(reject(RecordKind::Raw, &[0x00, 0xB0, 0x12, 0xFF, 0x13]), 3);
        assert_eq!(reject(RecordKind::Memory, &[0x00, 0xF0, 0x00]), 3);

        // raw records pass through when their header is valid
        assert!(adapter.encode(&Record::raw(&[0x00, 0xB0, 0x12])).is_ok());
    }
}
