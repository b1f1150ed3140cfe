//! Cluster messages exchanged between coordinators
//!
//! Frame format: [MAGIC][LEN][PAYLOAD][CRC32]
//! - MAGIC: 4 bytes, "QRM1"
//! - LEN: u32 LE, payload length
//! - PAYLOAD: bincode-encoded `ClusterMessage`
//! - CRC32: u32 LE over the payload

use crate::common::{crc32, Error, Result};
use crate::coordinator::ledger::ResourceLedger;
use crate::coordinator::membership::NodeRecord;
use serde::{Deserialize, Serialize};

const FRAME_MAGIC: [u8; 4] = [0x51, 0x52, 0x4D, 0x31]; // "QRM1"
const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 4;

/// Upper bound on a single frame payload
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Periodic liveness signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    /// Sender wall clock, Unix milliseconds
    pub timestamp: u64,
    pub claims_leader: bool,
    pub resources: ResourceLedger,
    /// Per-sender monotonically increasing counter
    pub sequence: u64,
    /// Sender's leadership epoch
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    Heartbeat(Heartbeat),
    Election {
        sender_id: String,
    },
    Alive {
        sender_id: String,
    },
    Coordinator {
        new_leader_id: String,
        epoch: u64,
    },
    JoinAnnouncement {
        node_id: String,
        resources: ResourceLedger,
        timestamp: u64,
    },
    ClusterStateSync {
        nodes: Vec<NodeRecord>,
        leader_id: Option<String>,
        epoch: u64,
    },
}

impl ClusterMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Heartbeat(_) => "heartbeat",
            ClusterMessage::Election { .. } => "election",
            ClusterMessage::Alive { .. } => "alive",
            ClusterMessage::Coordinator { .. } => "coordinator",
            ClusterMessage::JoinAnnouncement { .. } => "join",
            ClusterMessage::ClusterStateSync { .. } => "state-sync",
        }
    }
}

/// A message the coordinator wants sent once its lock is released
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { to: String, message: ClusterMessage },
    Broadcast(ClusterMessage),
}

/// Encode a message into a checksummed frame
pub fn encode_frame(message: &ClusterMessage) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::Corrupted(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode and verify a frame produced by [`encode_frame`]
pub fn decode_frame(frame: &[u8]) -> Result<ClusterMessage> {
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::Corrupted(format!("frame too short: {} bytes", frame.len())));
    }
    if frame[..4] != FRAME_MAGIC {
        return Err(Error::Corrupted("bad magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[4..8]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_PAYLOAD || frame.len() != HEADER_LEN + len + TRAILER_LEN {
        return Err(Error::Corrupted(format!(
            "length mismatch: header says {}, frame has {} bytes",
            len,
            frame.len()
        )));
    }

    let payload = &frame[HEADER_LEN..HEADER_LEN + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&frame[HEADER_LEN + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ledger::ResourceTag;

    fn heartbeat() -> ClusterMessage {
        ClusterMessage::Heartbeat(Heartbeat {
            node_id: "node-a".into(),
            timestamp: 1_700_000_000_000,
            claims_leader: true,
            resources: ResourceLedger::new(100)
                .with_tag("fidelity", ResourceTag::Number(0.99))
                .with_tag("connectivity", ResourceTag::Text("all-to-all".into())),
            sequence: 42,
            epoch: 3,
        })
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&heartbeat()).unwrap();
        assert_eq!(&frame[..4], b"QRM1");
        let len = u32::from_le_bytes(frame[4..8].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 8 + len + 4);
        assert_eq!(decode_frame(&frame).unwrap(), heartbeat());
    }

    #[test]
    fn test_state_sync_survives_framing() {
        let msg = ClusterMessage::ClusterStateSync {
            nodes: vec![NodeRecord::active("node-b", ResourceLedger::new(8))],
            leader_id: Some("node-b".into()),
            epoch: 2,
        };
        let decoded = decode_frame(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "state-sync");
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut frame = encode_frame(&heartbeat()).unwrap();
        frame[10] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(&heartbeat()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(Error::Corrupted(_))
        ));
        assert!(decode_frame(&frame[..6]).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = encode_frame(&heartbeat()).unwrap();
        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(Error::Corrupted(_))));
    }
}
