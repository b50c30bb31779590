//! Record Log
//!
//! Node-local, in-memory list of accepted writes. Not persisted.

use serde::Serialize;
use tokio::sync::RwLock;

use crate::state::NodeId;

/// One accepted write
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Position in the accepting leader's log
    pub index: u64,
    /// Leader's view epoch at acceptance
    pub epoch: u64,
    /// Leader that accepted the write
    pub leader_id: NodeId,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub accepted_at: chrono::DateTime<chrono::Utc>,
}

/// Append-only record log
#[derive(Default)]
pub struct RecordLog {
    records: RwLock<Vec<Record>>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write accepted locally as leader; returns its index
    pub async fn append_local(&self, leader_id: &str, epoch: u64, payload: Vec<u8>) -> u64 {
        let mut records = self.records.write().await;
        let index = records.last().map(|r| r.index + 1).unwrap_or(1);
        records.push(Record {
            index,
            epoch,
            leader_id: leader_id.to_string(),
            payload,
            accepted_at: chrono::Utc::now(),
        });
        index
    }

    /// Append a write replicated from a leader, keeping the leader's index
    pub async fn append_replicated(
        &self,
        leader_id: &str,
        epoch: u64,
        index: u64,
        payload: Vec<u8>,
    ) {
        self.records.write().await.push(Record {
            index,
            epoch,
            leader_id: leader_id.to_string(),
            payload,
            accepted_at: chrono::Utc::now(),
        });
    }

    pub async fn records(&self) -> Vec<Record> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_indexes_increase() {
        let log = RecordLog::new();
        assert!(log.is_empty().await);

        assert_eq!(log.append_local("n1", 1, b"a".to_vec()).await, 1);
        assert_eq!(log.append_local("n1", 1, b"b".to_vec()).await, 2);

        let records = log.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, b"b");
    }

    #[tokio::test]
    async fn test_local_index_continues_after_replicated() {
        let log = RecordLog::new();
        log.append_replicated("n1", 3, 7, b"x".to_vec()).await;

        // This node became leader later and keeps numbering forward
        assert_eq!(log.append_local("n2", 5, b"y".to_vec()).await, 8);
        assert_eq!(log.len().await, 2);
    }
}
