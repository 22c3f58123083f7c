//! Checkpoint envelope codecs
//!
//! A checkpoint is a long-lived artifact: it is written by one process and
//! read back by a later one, possibly after an upgrade, possibly from a
//! directory holding payloads written with a different codec. Raw serde
//! bytes cannot tell any of those cases apart - a bincode payload fed to a
//! JSON reader just produces serde soup, which the engine would misreport as
//! a corrupt session.
//!
//! Every codec therefore wraps its body in a small self-describing envelope:
//!
//! ```text
//! +----------+---------+--------+------------------+
//! | "CLQK"   | version | format | body...          |
//! | 4 bytes  | 1 byte  | 1 byte | codec-specific   |
//! +----------+---------+--------+------------------+
//! ```
//!
//! Decoding checks the magic, the envelope version, and the format tag
//! before touching the body, so the failure modes are precise:
//! [`CheckpointError::NotACheckpoint`] for foreign bytes,
//! [`CheckpointError::UnsupportedVersion`] for payloads from a newer layout,
//! [`CheckpointError::FormatMismatch`] when the store holds a different
//! codec's output, and [`CheckpointError::Decode`] only when the body itself
//! is damaged. The engine surfaces all of these as a fatal corrupt-session
//! error that an operator can act on.
//!
//! [`JsonCodec`] is the default (human-inspectable checkpoints);
//! [`BincodeCodec`] trades that for compactness.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CheckpointError, Result};

/// First bytes of every colloquy checkpoint payload
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CLQK";

/// Current envelope layout revision
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + 2;

/// Body encodings a checkpoint envelope can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Human-inspectable JSON body (default)
    Json,
    /// Compact bincode body
    Bincode,
}

impl CheckpointFormat {
    /// One-byte tag written into the envelope header
    pub fn tag(self) -> u8 {
        match self {
            CheckpointFormat::Json => b'j',
            CheckpointFormat::Bincode => b'b',
        }
    }

    /// Reverse of [`tag`](Self::tag)
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'j' => Some(CheckpointFormat::Json),
            b'b' => Some(CheckpointFormat::Bincode),
            _ => None,
        }
    }

    /// Name used in error messages
    pub fn name(self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Bincode => "bincode",
        }
    }
}

/// Encodes and decodes checkpoint payloads inside the envelope
///
/// Implementations supply only the body encoding; the envelope header is
/// written and verified by the provided `encode`/`decode` methods, so every
/// codec produces self-describing payloads with the same failure modes.
/// The round-trip must be lossless: `decode(encode(state)) == state`.
pub trait CheckpointCodec: Send + Sync {
    /// The body format this codec reads and writes
    fn format(&self) -> CheckpointFormat;

    /// Serialize a body (no envelope)
    fn encode_body<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a body (no envelope)
    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T>;

    /// Serialize a value into a complete enveloped payload
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let body = self.encode_body(value)?;
        let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
        payload.extend_from_slice(&CHECKPOINT_MAGIC);
        payload.push(ENVELOPE_VERSION);
        payload.push(self.format().tag());
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    /// Verify the envelope and deserialize the body
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        if payload.len() < HEADER_LEN {
            return Err(CheckpointError::NotACheckpoint(format!(
                "payload is {} bytes, shorter than the envelope header",
                payload.len()
            )));
        }
        if payload[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
            return Err(CheckpointError::NotACheckpoint(
                "missing envelope magic".to_string(),
            ));
        }
        let version = payload[CHECKPOINT_MAGIC.len()];
        if version != ENVELOPE_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let tag = payload[CHECKPOINT_MAGIC.len() + 1];
        let found = CheckpointFormat::from_tag(tag).ok_or_else(|| {
            CheckpointError::NotACheckpoint(format!("unknown format tag 0x{:02x}", tag))
        })?;
        if found != self.format() {
            return Err(CheckpointError::FormatMismatch {
                expected: self.format().name(),
                found: found.name().to_string(),
            });
        }
        self.decode_body(&payload[HEADER_LEN..])
    }
}

/// JSON-bodied checkpoint codec (default)
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointCodec for JsonCodec {
    fn format(&self) -> CheckpointFormat {
        CheckpointFormat::Json
    }

    fn encode_body<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        serde_json::from_slice(body).map_err(|e| CheckpointError::Decode(e.to_string()))
    }
}

/// Bincode-bodied checkpoint codec for compact storage
#[derive(Debug, Clone, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointCodec for BincodeCodec {
    fn format(&self) -> CheckpointFormat {
        CheckpointFormat::Bincode
    }

    fn encode_body<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        bincode::deserialize(body).map_err(|e| CheckpointError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct SessionState {
        turn_count: u64,
        last_response: Option<String>,
    }

    fn sample() -> SessionState {
        SessionState {
            turn_count: 7,
            last_response: Some("Where are you flying to?".to_string()),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec::new();
        let payload = codec.encode(&sample()).unwrap();
        let restored: SessionState = codec.decode(&payload).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_bincode_round_trip() {
        let codec = BincodeCodec::new();
        let payload = codec.encode(&sample()).unwrap();
        let restored: SessionState = codec.decode(&payload).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_envelope_header_is_written() {
        let payload = JsonCodec::new().encode(&sample()).unwrap();
        assert_eq!(&payload[..4], b"CLQK");
        assert_eq!(payload[4], ENVELOPE_VERSION);
        assert_eq!(payload[5], CheckpointFormat::Json.tag());
    }

    #[test]
    fn test_foreign_bytes_are_not_a_checkpoint() {
        let err = JsonCodec::new()
            .decode::<SessionState>(b"{\"turn_count\":7}")
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotACheckpoint(_)));

        let err = JsonCodec::new().decode::<SessionState>(b"CL").unwrap_err();
        assert!(matches!(err, CheckpointError::NotACheckpoint(_)));
    }

    #[test]
    fn test_cross_codec_read_is_a_format_mismatch() {
        let payload = BincodeCodec::new().encode(&sample()).unwrap();
        let err = JsonCodec::new().decode::<SessionState>(&payload).unwrap_err();
        match err {
            CheckpointError::FormatMismatch { expected, found } => {
                assert_eq!(expected, "json");
                assert_eq!(found, "bincode");
            }
            other => panic!("expected format mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_newer_envelope_version_is_rejected() {
        let mut payload = JsonCodec::new().encode(&sample()).unwrap();
        payload[4] = ENVELOPE_VERSION + 1;
        let err = JsonCodec::new().decode::<SessionState>(&payload).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::UnsupportedVersion(v) if v == ENVELOPE_VERSION + 1
        ));
    }

    #[test]
    fn test_damaged_body_is_a_decode_error() {
        let mut payload = JsonCodec::new().encode(&sample()).unwrap();
        payload.truncate(10);
        let err = JsonCodec::new().decode::<SessionState>(&payload).unwrap_err();
        assert!(matches!(err, CheckpointError::Decode(_)));
    }

    #[test]
    fn test_unknown_format_tag() {
        let mut payload = JsonCodec::new().encode(&sample()).unwrap();
        payload[5] = b'?';
        let err = JsonCodec::new().decode::<SessionState>(&payload).unwrap_err();
        assert!(matches!(err, CheckpointError::NotACheckpoint(_)));
    }
}
