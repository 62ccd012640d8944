//! Replica Liveness Table
//!
//! Tracks the last sign of life of every replica. Heartbeats and batch-ended
//! replies both count. The set of live replicas at batch dispatch time is
//! derived from this table.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Liveness snapshot for one replica (for the admin API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaLiveness {
    pub replica_id: String,
    /// Milliseconds since the last sign of life
    pub last_seen_ms_ago: u64,
    pub healthy: bool,
}

/// Replica-id to last-sign-of-life table
pub struct ReplicaLivenessTable {
    last_seen: RwLock<HashMap<String, Instant>>,
    acceptable_delay: Duration,
}

impl ReplicaLivenessTable {
    /// Create a new, empty liveness table
    pub fn new(acceptable_delay: Duration) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            acceptable_delay,
        }
    }

    /// The acceptable delay between two signs of life
    pub fn acceptable_delay(&self) -> Duration {
        self.acceptable_delay
    }

    /// Record a sign of life from a replica
    pub async fn sign_of_life(&self, replica_id: &str) {
        let mut last_seen = self.last_seen.write().await;
        if last_seen.insert(replica_id.to_string(), Instant::now()).is_none() {
            tracing::info!("Replica '{}' is now alive", replica_id);
        } else {
            tracing::trace!("Sign of life from replica '{}'", replica_id);
        }
    }

    /// Replicas considered live right now.
    ///
    /// Replicas whose last sign of life is older than the acceptable delay are
    /// removed from the table, so they are reported once and only come back
    /// with their next heartbeat.
    pub async fn running_replicas(&self) -> Vec<String> {
        let mut last_seen = self.last_seen.write().await;

        let stale: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= self.acceptable_delay)
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(seen) = last_seen.remove(&id) {
                tracing::warn!(
                    "Replica '{}' has not shown a sign of life for {:?}, it will not receive batch jobs",
                    id,
                    seen.elapsed()
                );
            }
        }

        let mut running: Vec<String> = last_seen.keys().cloned().collect();
        running.sort();
        running
    }

    /// Whether a replica is currently considered live
    pub async fn is_alive(&self, replica_id: &str) -> bool {
        let last_seen = self.last_seen.read().await;
        last_seen
            .get(replica_id)
            .map(|seen| seen.elapsed() < self.acceptable_delay)
            .unwrap_or(false)
    }

    /// Snapshot of the table, without pruning
    pub async fn snapshot(&self) -> Vec<ReplicaLiveness> {
        let last_seen = self.last_seen.read().await;
        let mut entries: Vec<ReplicaLiveness> = last_seen
            .iter()
            .map(|(id, seen)| ReplicaLiveness {
                replica_id: id.clone(),
                last_seen_ms_ago: seen.elapsed().as_millis() as u64,
                healthy: seen.elapsed() < self.acceptable_delay,
            })
            .collect();
        entries.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_of_life_makes_replica_running() {
        let table = ReplicaLivenessTable::new(Duration::from_secs(60));
        assert!(table.running_replicas().await.is_empty());

        table.sign_of_life("TWO").await;
        table.sign_of_life("ONE").await;
        table.sign_of_life("ONE").await;

        assert_eq!(table.running_replicas().await, vec!["ONE", "TWO"]);
        assert!(table.is_alive("ONE").await);
        assert!(!table.is_alive("THREE").await);
    }

    #[tokio::test]
    async fn test_stale_replicas_are_pruned() {
        let table = ReplicaLivenessTable::new(Duration::from_millis(50));
        table.sign_of_life("ONE").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        table.sign_of_life("TWO").await;

        assert_eq!(table.running_replicas().await, vec!["TWO"]);
        // Pruned entries are gone from the snapshot as well
        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].replica_id, "TWO");
        assert!(snapshot[0].healthy);
    }
}
