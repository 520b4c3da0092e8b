//! Plain Kansas City Standard byte stream

use crate::error::Result;
use crate::framing::{FrameResult, TapeItem};
use crate::protocol::{ProtocolSpec, TapeProtocol};
use crate::record::{DecodeIssue, Decoded, Record, RecordKind};

/// 300 baud, 1200/2400 Hz, 8-N-1; no block structure
pub struct Kcs {
    spec: ProtocolSpec,
}

impl Kcs {
    pub fn new() -> Self {
        Self {
            spec: ProtocolSpec::kcs(),
        }
    }
}

impl Default for Kcs {
    fn default() -> Self {
        Self::new()
    }
}

impl TapeProtocol for Kcs {
    fn spec(&self) -> &ProtocolSpec {
        &self.spec
    }

    /// Every frame becomes one record byte; the stream ends with the signal
    fn decode(&self, frames: &mut dyn Iterator<Item = FrameResult>) -> Decoded {
        let mut record = Record::empty(RecordKind::Raw);
        let mut issues = Vec::new();
        for frame in frames {
            match frame {
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
        Decoded { record, issues }
    }

    fn encode(&self, record: &Record) -> Result<Vec<TapeItem>> {
        Ok(record
            .intact_bytes()?
            .into_iter()
            .map(TapeItem::Byte)
            .collect())
    }
}
