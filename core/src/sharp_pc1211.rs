//! Sharp PC-1211 program tapes
//!
//! Tape layout: ident byte 0x80, an 8-byte filename block, program lines
//! (`0xEh 0xto` BCD line number, tokens, 0x00) and the end marker 0xF0.
//! A running checksum byte follows every 8 bytes after the ident.

use crate::error::{CodecError, Result};
use crate::framing::{FrameResult, TapeItem};
use crate::protocol::{ProtocolSpec, TapeProtocol};
use crate::record::{DecodeIssue, Decoded, Record, RecordKind};
use log::{debug, warn};

pub const PROGRAM_IDENT: u8 = 0x80;
pub const END_MARKER: u8 = 0xF0;
pub const FILENAME_BYTES: usize = 8;
const FILENAME_END: u8 = 0x5F;
const FILENAME_CHARS: usize = FILENAME_BYTES - 1;
const LINE_END: u8 = 0x00;

/// Data bytes covered by one checksum byte
pub const CHECKSUM_GROUP: usize = 8;
/// Data bytes after which the checksum restarts and a carrier gap is sent
pub const CHECKSUM_BLOCK: usize = 80;
const FILENAME_GAP_SECS: f32 = 0.25;
const BLOCK_GAP_SECS: f32 = 4.0;

/// Add one byte to the running checksum
///
/// The high nibble is added with end-around carry, then the low nibble
/// modulo 256.
pub fn checksum_add(sum: u8, byte: u8) -> u8 {
    let mut acc = sum as u16 + (byte >> 4) as u16;
    if acc > 0xFF {
        acc = (acc + 1) & 0xFF;
    }
    ((acc + (byte & 0x0F) as u16) & 0xFF) as u8
}

/// BCD line number bytes, `0xE0 | hundreds` then tens and ones
pub fn line_number_bytes(line: u16) -> Result<[u8; 2]> {
    if !(1..=999).contains(&line) {
        return Err(CodecError::InvalidConfig(format!(
            "line number {} outside 1..=999",
            line
        )));
    }
    let hundreds = (line / 100) as u8;
    let tens = (line / 10 % 10) as u8;
    let ones = (line % 10) as u8;
    Ok([0xE0 | hundreds, tens << 4 | ones])
}

pub fn line_number(bytes: [u8; 2]) -> Option<u16> {
    let [hi, lo] = bytes;
    if hi & 0xF0 != 0xE0 || hi & 0x0F > 9 || lo >> 4 > 9 || lo & 0x0F > 9 {
        return None;
    }
    Some((hi & 0x0F) as u16 * 100 + (lo >> 4) as u16 * 10 + (lo & 0x0F) as u16)
}

fn swap_nibbles(byte: u8) -> u8 {
    byte.rotate_left(4)
}

/// Filename block from calculator character codes
///
/// At most seven codes are kept. They go on tape in reverse order with their
/// nibbles swapped, front-padded with 0x00 and closed by 0x5F.
pub fn encode_filename(codes: &[u8]) -> [u8; FILENAME_BYTES] {
    let mut block = [0u8; FILENAME_BYTES];
    let kept = &codes[..codes.len().min(FILENAME_CHARS)];
    for (slot, &code) in block[..FILENAME_CHARS].iter_mut().rev().zip(kept) {
        *slot = swap_nibbles(code);
    }
    block[FILENAME_CHARS] = FILENAME_END;
    block
}

/// Character codes of a filename block, padding removed
pub fn decode_filename(block: &[u8; FILENAME_BYTES]) -> Vec<u8> {
    let mut codes: Vec<u8> = block[..FILENAME_CHARS]
        .iter()
        .rev()
        .map(|&b| swap_nibbles(b))
        .collect();
    while codes.last() == Some(&0x00) {
        codes.pop();
    }
    codes
}

/// Running checksum state shared by both directions
#[derive(Debug, Default)]
struct Checksum {
    sum: u8,
    count: usize,
}

impl Checksum {
    fn reset(&mut self) {
        self.sum = 0;
        self.count = 0;
    }

    /// Count a data byte; true when a checksum byte is due after it
    fn add(&mut self, byte: Option<u8>) -> bool {
        if let Some(byte) = byte {
            self.sum = checksum_add(self.sum, byte);
        }
        self.count += 1;
        self.count % CHECKSUM_GROUP == 0
    }
}

pub struct SharpPc1211 {
    spec: ProtocolSpec,
}

impl SharpPc1211 {
    pub fn new() -> Self {
        Self {
            spec: ProtocolSpec::sharp_pc1211(),
        }
    }

    /// Check the record layout; returns the number of bytes before 0xF0
    fn validate(bytes: &[u8]) -> Result<usize> {
        match bytes.first() {
            Some(&PROGRAM_IDENT) => {}
            Some(&other) => {
                return Err(CodecError::unsupported(
                    0,
                    format!("ident {:#04x} is not a program ident", other),
                ))
            }
            None => return Err(CodecError::unsupported(0, "empty record")),
        }
        if bytes.len() < 1 + FILENAME_BYTES {
            return Err(CodecError::unsupported(bytes.len(), "filename block cut short"));
        }

        let mut index = 1 + FILENAME_BYTES;
        while let Some(&byte) = bytes.get(index) {
            if byte == END_MARKER {
                if index + 1 < bytes.len() {
                    return Err(CodecError::unsupported(
                        index + 1,
                        "data after the end marker",
                    ));
                }
                return Ok(index);
            }
            if byte & 0xF0 != 0xE0 {
                return Err(CodecError::unsupported(
                    index,
                    format!("unknown record type {:#04x}", byte),
                ));
            }
            let body = index + 2;
            if body > bytes.len() {
                return Err(CodecError::unsupported(bytes.len(), "line number cut short"));
            }
            let end = bytes[body..]
                .iter()
                .position(|&b| b == LINE_END)
                .ok_or_else(|| CodecError::unsupported(bytes.len(), "line without terminator"))?;
            index = body + end + 1;
        }
        Err(CodecError::unsupported(bytes.len(), "missing end marker 0xF0"))
    }
}

impl Default for SharpPc1211 {
    fn default() -> Self {
        Self::new()
    }
}

impl TapeProtocol for SharpPc1211 {
    fn spec(&self) -> &ProtocolSpec {
        &self.spec
    }

    fn decode(&self, frames: &mut dyn Iterator<Item = FrameResult>) -> Decoded {
        let mut record = Record::empty(RecordKind::Program);
        let mut issues = Vec::new();

        match frames.next() {
            Some(Ok(frame)) => {
                if frame.byte != PROGRAM_IDENT {
                    warn!("unexpected ident byte {:#04x}", frame.byte);
                    issues.push(DecodeIssue::MissingHeader);
                }
                record.bytes.push(Some(frame.byte));
            }
            Some(Err(error)) => {
                issues.push(DecodeIssue::Frame {
                    index: Some(0),
                    error,
                });
                record.bytes.push(None);
            }
            None => {
                issues.push(DecodeIssue::MissingTerminator);
                return Decoded { record, issues };
            }
        }

        let mut checksum = Checksum::default();
        let mut in_filename = true;
        let mut checksum_due = false;
        let mut group_damaged = false;
        let mut terminated = false;

        for frame in frames {
            if checksum_due {
                checksum_due = false;
                match frame {
                    Ok(frame) => {
                        if frame.byte != checksum.sum && !group_damaged {
                            warn!(
                                "checksum mismatch at sample {}: computed {:#04x}, read {:#04x}",
                                frame.position,
                                checksum.sum,
                                frame.byte
                            );
                            issues.push(DecodeIssue::Checksum {
                                index: record.len() - 1,
                                position: frame.position,
                                expected: checksum.sum,
                                found: frame.byte,
                            });
                        }
                        // keep later groups checkable after damage
                        checksum.sum = frame.byte;
                    }
                    Err(error) => issues.push(DecodeIssue::Frame { index: None, error }),
                }
                group_damaged = false;
                if in_filename {
                    in_filename = false;
                    checksum.reset();
                } else if checksum.count == CHECKSUM_BLOCK {
                    checksum.reset();
                }
                continue;
            }

            let byte = match frame {
                Ok(frame) => Some(frame.byte),
                Err(error) => {
                    issues.push(DecodeIssue::Frame {
                        index: Some(record.len()),
                        error,
                    });
                    group_damaged = true;
                    None
                }
            };
            record.bytes.push(byte);
            checksum_due = checksum.add(byte);
            if byte == Some(END_MARKER) && !in_filename {
                terminated = true;
                break;
            }
        }

        if !terminated {
            issues.push(DecodeIssue::MissingTerminator);
        }
        if let Some(name) = record
            .bytes
            .get(1..1 + FILENAME_BYTES)
            .and_then(|b| b.iter().copied().collect::<Option<Vec<u8>>>())
            .and_then(|b| <[u8; FILENAME_BYTES]>::try_from(b).ok())
        {
            debug!(
                "program name {:02x?}, {} bytes",
                decode_filename(&name),
                record.len()
            );
        }
        Decoded { record, issues }
    }

    fn encode(&self, record: &Record) -> Result<Vec<TapeItem>> {
        if record.kind == RecordKind::Memory {
            return Err(CodecError::unsupported(0, "memory dumps are not supported"));
        }
        let bytes = record.intact_bytes()?;
        let end = Self::validate(&bytes)?;

        let mut items = vec![TapeItem::Byte(PROGRAM_IDENT)];
        let mut checksum = Checksum::default();

        for &byte in &bytes[1..1 + FILENAME_BYTES] {
            items.push(TapeItem::Byte(byte));
            if checksum.add(Some(byte)) {
                items.push(TapeItem::Byte(checksum.sum));
            }
        }
        checksum.reset();
        items.push(TapeItem::Carrier(FILENAME_GAP_SECS));

        for &byte in &bytes[1 + FILENAME_BYTES..=end] {
            items.push(TapeItem::Byte(byte));
            if checksum.add(Some(byte)) {
                items.push(TapeItem::Byte(checksum.sum));
                if checksum.count == CHECKSUM_BLOCK {
                    checksum.reset();
                    items.push(TapeItem::Carrier(BLOCK_GAP_SECS));
                }
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Frame, FrameError, FrameFault};

    /// Ident, filename "AB", one line per token list, end marker
    fn program(lines: &[(u16, &[u8])]) -> Vec<u8> {
        let mut bytes = vec![PROGRAM_IDENT];
        bytes.extend(encode_filename(&[0x11, 0x12]));
        for &(line, tokens) in lines {
            bytes.extend(line_number_bytes(line).unwrap());
            bytes.extend_from_slice(tokens);
            bytes.push(LINE_END);
        }
        bytes.push(END_MARKER);
        bytes
    }

    fn tape_bytes(items: &[TapeItem]) -> Vec<FrameResult> {
        items
            .iter()
            .filter_map(|item| match *item {
                TapeItem::Byte(byte) => Some(byte),
                TapeItem::Carrier(_) => None,
            })
            .enumerate()
            .map(|(i, byte)| {
                Ok(Frame {
                    byte,
                    position: i as u64 * 1824,
                })
            })
            .collect()
    }

    #[test]
    fn test_checksum_end_around_carry() {
        assert_eq!(checksum_add(0x00, 0x12), 0x03);
        assert_eq!(checksum_add(0xFE, 0x20), 0x01);
        assert_eq!(checksum_add(0xFF, 0x0F), 0x0E);
    }

    #[test]
    fn test_line_numbers() {
        assert_eq!(line_number_bytes(10).unwrap(), [0xE0, 0x10]);
        assert_eq!(line_number_bytes(999).unwrap(), [0xE9, 0x99]);
        assert_eq!(line_number([0xE1, 0x23]), Some(123));
        assert_eq!(line_number([0xD1, 0x23]), None);
        assert!(line_number_bytes(0).is_err());
        assert!(line_number_bytes(1000).is_err());
    }

    #[test]
    fn test_filename_block() {
        let block = encode_filename(&[0x11, 0x12, 0x13]);
        assert_eq!(block, [0x00, 0x00, 0x00, 0x00, 0x31, 0x21, 0x11, 0x5F]);
        assert_eq!(decode_filename(&block), vec![0x11, 0x12, 0x13]);
        // long names are cut at seven characters
        let long = encode_filename(&[0x11; 9]);
        assert_eq!(decode_filename(&long).len(), 7);
    }

    #[test]
    fn test_encode_inserts_checksums_and_gaps() {
        let bytes = program(&[(10, &[0x41, 0x42])]);
        let items = SharpPc1211::new()
            .encode(&Record::new(RecordKind::Program, &bytes))
            .unwrap();
        // ident, 8 filename bytes, checksum, gap
        assert_eq!(items[0], TapeItem::Byte(0x80));
        let filename_sum = bytes[1..9].iter().fold(0, |s, &b| checksum_add(s, b));
        assert_eq!(items[9], TapeItem::Byte(filename_sum));
        assert_eq!(items[10], TapeItem::Carrier(0.25));
        assert_eq!(items.last(), Some(&TapeItem::Byte(END_MARKER)));
    }

    #[test]
    fn test_long_program_gets_block_gap() {
        let tokens = [0x20u8; 30];
        let lines: Vec<(u16, &[u8])> = (1..=4).map(|n| (n * 10, &tokens[..])).collect();
        let bytes = program(&lines);
        let items = SharpPc1211::new()
            .encode(&Record::new(RecordKind::Program, &bytes))
            .unwrap();
        let gaps: Vec<&TapeItem> = items
            .iter()
            .filter(|i| matches!(i, TapeItem::Carrier(_)))
            .collect();
        assert_eq!(gaps, vec![&TapeItem::Carrier(0.25), &TapeItem::Carrier(4.0)]);
    }

    #[test]
    fn test_decode_strips_checksums() {
        let tokens = [0x20u8; 30];
        let lines: Vec<(u16, &[u8])> = (1..=4).map(|n| (n * 10, &tokens[..])).collect();
        let bytes = program(&lines);
        let adapter = SharpPc1211::new();
        let items = adapter.encode(&Record::new(RecordKind::Program, &bytes)).unwrap();

        let mut frames = tape_bytes(&items).into_iter();
        let decoded = adapter.decode(&mut frames);
        assert!(decoded.is_clean(), "{:?}", decoded.issues);
        assert_eq!(decoded.record, Record::new(RecordKind::Program, &bytes));
    }

    #[test]
    fn test_decode_reports_checksum_mismatch() {
        let bytes = program(&[(10, &[0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47])]);
        let adapter = SharpPc1211::new();
        let items = adapter.encode(&Record::new(RecordKind::Program, &bytes)).unwrap();
        let mut frames = tape_bytes(&items);
        // first data byte after the filename checksum
        let Ok(frame) = frames[10] else { unreachable!() };
        frames[10] = Ok(Frame {
            byte: frame.byte ^ 0x01,
            ..frame
        });

        let decoded = adapter.decode(&mut frames.into_iter());
        assert_eq!(decoded.issues.len(), 1, "{:?}", decoded.issues);
        assert!(matches!(
            decoded.issues[0],
            DecodeIssue::Checksum { index: 16, .. }
        ));
        assert_eq!(decoded.record.len(), bytes.len());
    }

    #[test]
    fn test_damaged_group_skips_checksum_report() {
        let bytes = program(&[(10, &[0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47])]);
        let adapter = SharpPc1211::new();
        let items = adapter.encode(&Record::new(RecordKind::Program, &bytes)).unwrap();
        let mut frames = tape_bytes(&items);
        frames[11] = Err(FrameError {
            position: 11 * 1824,
            fault: FrameFault::Parity,
        });

        let decoded = adapter.decode(&mut frames.into_iter());
        assert_eq!(decoded.issues.len(), 1, "{:?}", decoded.issues);
        assert!(matches!(
            decoded.issues[0],
            DecodeIssue::Frame { index: Some(10), .. }
        ));
        assert_eq!(decoded.record.bytes[10], None);
        assert_eq!(decoded.record.damaged(), 1);
    }

    #[test]
    fn test_decode_missing_end_marker() {
        let bytes = program(&[(10, &[0x41])]);
        let adapter = SharpPc1211::new();
        let items = adapter.encode(&Record::new(RecordKind::Program, &bytes)).unwrap();
        let mut frames = tape_bytes(&items);
        frames.pop();
        let decoded = adapter.decode(&mut frames.into_iter());
        assert_eq!(decoded.issues, vec![DecodeIssue::MissingTerminator]);
    }

    #[test]
    fn test_encode_rejections() {
        let adapter = SharpPc1211::new();
        let reject = |bytes: &[u8]| -> usize {
            match adapter.encode(&Record::new(RecordKind::Program, bytes)) {
                Err(CodecError::UnsupportedRecord { index, .. }) => index,
                other => panic!("expected UnsupportedRecord, got {:?}", other),
            }
        };
        let good = program(&[(10, &[0x41])]);

        assert_eq!(reject(&[0x81]), 0);
        assert_eq!(reject(&good[..5]), 5);
        // 0x30 is not a line number or end marker
        let mut unknown = good[..9].to_vec();
        unknown.extend([0x30, 0xF0]);
        assert_eq!(reject(&unknown), 9);
        // line without its 0x00
        let mut open_line = good[..9].to_vec();
        open_line.extend([0xE0, 0x10, 0x41]);
        assert_eq!(reject(&open_line), 12);
        let mut trailing = good.clone();
        trailing.push(0x00);
        assert_eq!(reject(&trailing), good.len());
        assert_eq!(reject(&good[..good.len() - 1]), good.len() - 1);

        let memory = Record::new(RecordKind::Memory, &good);
        assert!(adapter.encode(&memory).is_err());
    }
}
