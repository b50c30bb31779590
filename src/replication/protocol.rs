//! Replication Protocol
//!
//! Defines the wire protocol between a leader and its followers.

use serde::{Deserialize, Serialize};

use crate::state::NodeId;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Accepted write pushed from the leader
    Replicate {
        leader_id: NodeId,
        /// Leader's view epoch at acceptance
        epoch: u64,
        /// Position in the leader's record log
        index: u64,
        payload: Vec<u8>,
    },

    /// Follower's answer to `Replicate`
    ReplicateAck {
        node_id: NodeId,
        index: u64,
        accepted: bool,
        reason: Option<String>,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Message not valid in this direction
    Unexpected,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Replicate { .. } => "Replicate",
            Message::ReplicateAck { .. } => "ReplicateAck",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body a peer may announce
    pub const MAX_BODY: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_payload_survives_encoding() {
        let payload = vec![0u8, 159, 146, 150, b'{', b'}'];
        let msg = Message::Replicate {
            leader_id: "node-1".to_string(),
            epoch: 4,
            index: 17,
            payload: payload.clone(),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Replicate { leader_id, epoch, index, payload: restored } => {
                assert_eq!(leader_id, "node-1");
                assert_eq!(epoch, 4);
                assert_eq!(index, 17);
                assert_eq!(restored, payload);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(restored.checksum, crc32fast::hash(data));
    }
}
