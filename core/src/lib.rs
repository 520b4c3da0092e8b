//! Cassette tape codec for programmable calculators
//!
//! Frequency-shift keyed (Kansas City Standard family) tones with
//! per-calculator framing, block structure and checksums.

pub mod error;
pub mod signal;
pub mod filter;
pub mod resample;
pub mod protocol;
pub mod record;
pub mod framing;
pub mod demod;
pub mod modulator;
pub mod kcs;
pub mod casio_fx502p;
pub mod sharp_pc1211;
pub mod pipeline;
pub mod encoder;
pub mod decoder;

pub use decoder::{DecodeReport, Decoder};
pub use encoder::Encoder;
pub use error::{CodecError, Result};
pub use filter::BandPass;
pub use pipeline::{CancelToken, DecodeOptions, EncodeOptions, Stage};
pub use protocol::{Family, ProtocolSpec, TapeProtocol};
pub use record::{DecodeIssue, Decoded, Record, RecordKind};

// Signal configuration
pub const SAMPLE_RATE: usize = 48000;
pub const TONE_AMPLITUDE: f32 = 0.5;
/// Hysteresis around zero used by the crossing detector (full scale = 1.0)
pub const SQUELCH_LEVEL: f32 = 0.01;

// Clock recovery
pub const LEADER_DETECT_MS: usize = 400;
pub const LEADER_DETECT_SAMPLES: usize = (SAMPLE_RATE * LEADER_DETECT_MS) / 1000; // 19200
/// Accepted deviation of tape speed from nominal, as a fraction
pub const SPEED_TOLERANCE: f32 = 0.12;
pub const CARRIER_LOSS_MS: usize = 1000;
pub const CARRIER_LOSS_SAMPLES: usize = (SAMPLE_RATE * CARRIER_LOSS_MS) / 1000; // 48000
/// Shortest run of unrecognizable signal between frames that counts as lost data
pub const DROPOUT_MIN_CELLS: f32 = 2.0;
