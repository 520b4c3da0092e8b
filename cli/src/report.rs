//! Text form of a decoded record
//!
//! ```json
//! {
//!   "protocol": "fx502p",
//!   "kind": "program",
//!   "bytes": "23b1 10??30",
//!   "issues": ["byte 3: parity error at sample 201600"],
//!   "speed": 0.998
//! }
//! ```
//!
//! Whitespace inside `bytes` is ignored on input; `??` marks a damaged byte.

use crate::error::{CliError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tapecodec_core::{DecodeReport, Family, Record, RecordKind};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordReport {
    pub protocol: String,
    pub kind: String,
    pub bytes: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl RecordReport {
    pub fn from_decode(family: Family, report: &DecodeReport) -> Self {
        Self {
            protocol: family.name().to_string(),
            kind: report.record.kind.name().to_string(),
            bytes: format_bytes(&report.record.bytes),
            issues: report.issues.iter().map(|i| i.to_string()).collect(),
            speed: report.speed,
        }
    }

    pub fn to_record(&self, family: Family) -> Result<Record> {
        if !self.protocol.eq_ignore_ascii_case(family.name()) {
            warn!(
                "Report was decoded as {}, encoding it as {}",
                self.protocol, family
            );
        }
        let kind = parse_kind(&self.kind)?;
        Ok(Record {
            kind,
            bytes: parse_bytes(&self.bytes)?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

fn parse_kind(name: &str) -> Result<RecordKind> {
    [RecordKind::Raw, RecordKind::Program, RecordKind::Memory]
        .into_iter()
        .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| CliError::Malformed(format!("unknown record kind '{}'", name)))
}

/// Hex pairs, `??` for damaged bytes, a space every 8 bytes
pub fn format_bytes(bytes: &[Option<u8>]) -> String {
    let mut text = String::with_capacity(bytes.len() * 2 + bytes.len() / 8);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 && i % 8 == 0 {
            text.push(' ');
        }
        match byte {
            Some(b) => text.push_str(&format!("{:02x}", b)),
            None => text.push_str("??"),
        }
    }
    text
}

pub fn parse_bytes(text: &str) -> Result<Vec<Option<u8>>> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::Malformed(
            "odd number of hex digits in bytes".to_string(),
        ));
    }
    digits
        .chunks(2)
        .enumerate()
        .map(|(index, pair)| {
            let pair: String = pair.iter().collect();
            if pair == "??" {
                return Ok(None);
            }
            u8::from_str_radix(&pair, 16)
                .map(Some)
                .map_err(|_| CliError::Malformed(format!("byte {}: '{}' is not hex", index, pair)))
        })
        .collect()
}

/// Raw bytes for binary output; damaged positions become 0x00
pub fn binary_bytes(record: &Record) -> Vec<u8> {
    let damaged = record.damaged();
    if damaged > 0 {
        warn!("{} damaged byte(s) written as 0x00", damaged);
    }
    record.bytes.iter().map(|b| b.unwrap_or(0)).collect()
}
