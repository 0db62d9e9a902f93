use crate::ledger::HeartbeatLedger;
use crate::metrics::{CounterSnapshot, SharedMetrics};
use crate::models::ConnectionState;
use crate::watchdog::{classify, elapsed_since, Liveness, Thresholds};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

/// Vue /health, recalculée à chaque appel
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub uptime: String,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub agent_status: BTreeMap<String, Liveness>,
    pub connections: BTreeMap<String, ConnectionState>,
}

#[derive(Clone)]
pub struct StatusAggregator {
    ledger: HeartbeatLedger,
    metrics: SharedMetrics,
    thresholds: Thresholds,
}

impl StatusAggregator {
    pub fn new(ledger: HeartbeatLedger, metrics: SharedMetrics, thresholds: Thresholds) -> Self {
        Self {
            ledger,
            metrics,
            thresholds,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_at(OffsetDateTime::now_utc())
    }

    pub fn snapshot_at(&self, now: OffsetDateTime) -> StatusSnapshot {
        let uptime_seconds = self.metrics.uptime().as_secs();

        // agents jamais entendus : absents du ledger, donc de la map
        let agent_status = self
            .ledger
            .records()
            .into_iter()
            .map(|r| {
                let liveness = classify(elapsed_since(now, r.last_seen_at), &self.thresholds);
                (r.agent_id, liveness)
            })
            .collect();

        let connections = self.metrics.connection_states();
        let status = if connections.values().all(|s| *s == ConnectionState::Connected) {
            "operational"
        } else {
            "degraded"
        };

        StatusSnapshot {
            status,
            uptime: humantime::format_duration(Duration::from_secs(uptime_seconds)).to_string(),
            uptime_seconds,
            counters: self.metrics.counters(),
            agent_status,
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::models::Tier;
    use std::sync::Arc;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2026-05-04 12:00:00 UTC);

    fn aggregator() -> (StatusAggregator, HeartbeatLedger, SharedMetrics) {
        let ledger = HeartbeatLedger::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            StatusAggregator::new(ledger.clone(), metrics.clone(), Thresholds::default()),
            ledger,
            metrics,
        )
    }

    #[test]
    fn agents_are_classified_by_silence() {
        let (status, ledger, _) = aggregator();
        ledger.record_at("eva.banker", T - time::Duration::seconds(2));
        ledger.record_at("eva.core", T - time::Duration::seconds(15));
        ledger.record_at("eva.lab", T - time::Duration::minutes(5));

        let snap = status.snapshot_at(T);

        assert_eq!(snap.agent_status["eva.banker"], Liveness::Online);
        assert_eq!(snap.agent_status["eva.core"], Liveness::Degraded);
        assert_eq!(snap.agent_status["eva.lab"], Liveness::Offline);
    }

    #[test]
    fn never_seen_agent_is_absent() {
        let (status, ledger, _) = aggregator();
        ledger.record_at("eva.core", T);

        let snap = status.snapshot_at(T);

        assert_eq!(snap.agent_status.len(), 1);
        assert!(!snap.agent_status.contains_key("eva.banker"));
    }

    #[test]
    fn status_follows_subscription_loops() {
        let (status, _, metrics) = aggregator();
        assert_eq!(status.snapshot_at(T).status, "operational");

        let danger = metrics.connection("router/danger");
        let trade = metrics.connection("router/trade");
        danger.set(ConnectionState::Connected);
        trade.set(ConnectionState::Connecting);
        assert_eq!(status.snapshot_at(T).status, "degraded");

        trade.set(ConnectionState::Connected);
        assert_eq!(status.snapshot_at(T).status, "operational");
    }

    #[test]
    fn serialized_snapshot_has_flat_counters() {
        let (status, ledger, metrics) = aggregator();
        metrics.record_received(Tier::P0);
        metrics.record_error();
        ledger.record_at("eva.banker", T);
        metrics.connection("heartbeats").set(ConnectionState::Connected);

        let json = serde_json::to_value(status.snapshot_at(T)).unwrap();

        assert_eq!(json["status"], "operational");
        assert_eq!(json["danger_signals"], 1);
        assert_eq!(json["total_messages_routed"], 1);
        assert_eq!(json["errors_total"], 1);
        assert_eq!(json["agent_status"]["eva.banker"], "ONLINE");
        assert_eq!(json["connections"]["heartbeats"], "CONNECTED");
        assert!(json["uptime"].is_string());
        assert!(json["uptime_seconds"].is_u64());
    }
}
