use crate::error::{CodecError, Result};
use crate::framing::FrameError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Plain byte stream without calculator block structure
    Raw,
    Program,
    /// Register/memory dump
    Memory,
}

impl RecordKind {
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Raw => "raw",
            RecordKind::Program => "program",
            RecordKind::Memory => "memory",
        }
    }
}

/// Decoded logical content of one tape block
///
/// `None` marks a byte that could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub bytes: Vec<Option<u8>>,
}

impl Record {
    pub fn new(kind: RecordKind, bytes: &[u8]) -> Self {
        Self {
            kind,
            bytes: bytes.iter().copied().map(Some).collect(),
        }
    }

    pub fn raw(bytes: &[u8]) -> Self {
        Self::new(RecordKind::Raw, bytes)
    }

    pub fn empty(kind: RecordKind) -> Self {
        Self {
            kind,
            bytes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn damaged(&self) -> usize {
        self.bytes.iter().filter(|b| b.is_none()).count()
    }

    /// The bytes, failing at the first damaged position
    pub fn intact_bytes(&self) -> Result<Vec<u8>> {
        self.bytes
            .iter()
            .enumerate()
            .map(|(index, byte)| {
                byte.ok_or_else(|| CodecError::unsupported(index, "damaged byte has no value"))
            })
            .collect()
    }
}

/// Non-fatal problem found while decoding
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeIssue {
    /// `index` is the placeholder position in the record, if the frame had one
    #[error("{}{error}", .index.map(|i| format!("byte {}: ", i)).unwrap_or_default())]
    Frame {
        index: Option<usize>,
        error: FrameError,
    },

    /// `index` is the last record byte covered by the checksum
    #[error(
        "checksum mismatch after byte {index} at sample {position}: \
         computed {expected:#04x}, tape has {found:#04x}"
    )]
    Checksum {
        index: usize,
        position: u64,
        expected: u8,
        found: u8,
    },

    #[error("no block header found")]
    MissingHeader,

    #[error("signal ended before the end-of-block marker")]
    MissingTerminator,
}

/// Adapter output: best-effort record plus everything that went wrong
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub record: Record,
    pub issues: Vec<DecodeIssue>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}
