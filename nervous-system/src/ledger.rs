use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Dernier heartbeat connu d'un agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub agent_id: String,
    pub last_seen_at: OffsetDateTime,
}

/// Registre concurrent agent -> dernier heartbeat.
/// Écrit par le heartbeat listener uniquement, lu par le watchdog et le snapshot.
/// Une entrée est créée au premier heartbeat et n'est jamais supprimée.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatLedger {
    inner: Arc<DashMap<String, OffsetDateTime>>,
}

impl HeartbeatLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: &str) {
        self.record_at(agent_id, OffsetDateTime::now_utc());
    }

    pub fn record_at(&self, agent_id: &str, at: OffsetDateTime) {
        self.inner.insert(agent_id.to_string(), at);
    }

    pub fn last_seen(&self, agent_id: &str) -> Option<OffsetDateTime> {
        self.inner.get(agent_id).map(|entry| *entry.value())
    }

    /// Copie point-in-time ; chaque shard n'est verrouillé que le temps de sa copie
    pub fn records(&self) -> Vec<HeartbeatRecord> {
        self.inner
            .iter()
            .map(|entry| HeartbeatRecord {
                agent_id: entry.key().clone(),
                last_seen_at: *entry.value(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn first_heartbeat_creates_then_overwrites() {
        let ledger = HeartbeatLedger::new();
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_seen("eva.banker"), None);

        ledger.record_at("eva.banker", datetime!(2026-03-01 10:00:00 UTC));
        ledger.record_at("eva.banker", datetime!(2026-03-01 10:00:07 UTC));

        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.last_seen("eva.banker"),
            Some(datetime!(2026-03-01 10:00:07 UTC))
        );
    }

    #[test]
    fn clones_share_the_same_records() {
        let ledger = HeartbeatLedger::new();
        let reader = ledger.clone();
        ledger.record("eva.core");

        let records = reader.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent_id, "eva.core");
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_agents() {
        let ledger = HeartbeatLedger::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger.record(&format!("agent-{i}"));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ledger.len(), 8);
    }
}
