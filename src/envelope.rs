// envelope.rs - Message Envelope
//
//! The transport-level unit carried between two agents.
//!
//! An [`Envelope`] is immutable once built: the Router stamps the sequence
//! number and timestamp, connectors move it by value, and the receiving
//! Router consumes it once.

use crate::address::AgentId;
use crate::codec::FramingError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    source: AgentId,

    destination: AgentId,

    payload: Vec<u8>,

    /// Position in the stream of messages from `source` to `destination`
    sequence: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(source: AgentId, destination: AgentId, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            source,
            destination,
            payload,
            sequence,
            // wire precision is milliseconds
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn source(&self) -> &AgentId {
        &self.source
    }

    pub fn destination(&self) -> &AgentId {
        &self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the payload, consuming the envelope
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize for byte-oriented media
    pub fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FramingError::Encode(e.to_string()))
    }

    /// Deserialize a complete envelope; trailing bytes are a framing error
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let (envelope, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| FramingError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(FramingError::Decode(format!(
                "{} trailing bytes after envelope",
                bytes.len() - read
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_accessors() {
        let env = Envelope::new("a".parse().unwrap(), "b".parse().unwrap(), b"ping".to_vec(), 7);
        assert_eq!(env.source().as_str(), "a");
        assert_eq!(env.destination().as_str(), "b");
        assert_eq!(env.payload(), b"ping");
        assert_eq!(env.sequence(), 7);
    }

    #[test]
    fn test_bytes_keep_millisecond_timestamp() {
        let env = Envelope::new("home/pv".parse().unwrap(), "home/ems".parse().unwrap(), vec![0, 1, 2], 1);
        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_garbage_is_framing_error() {
        assert!(matches!(
            Envelope::from_bytes(&[0xFF, 0xFF, 0xFF]),
            Err(FramingError::Decode(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let env = Envelope::new("a".parse().unwrap(), "b".parse().unwrap(), vec![], 0);
        let mut bytes = env.to_bytes().unwrap();
        bytes.push(0);
        assert!(Envelope::from_bytes(&bytes).is_err());
    }
}
