use crate::ledger::HeartbeatLedger;
use crate::metrics::SharedMetrics;
use crate::models::{AgentSpec, Message};
use crate::supervisor::Dispatch;
use std::collections::HashMap;
use tracing::debug;

/// Boucle sans forward : la simple réception d'un heartbeat vaut signe de vie,
/// le payload n'est pas lu.
pub struct HeartbeatListener {
    agents_by_topic: HashMap<String, String>,
    ledger: HeartbeatLedger,
    metrics: SharedMetrics,
}

impl HeartbeatListener {
    pub fn new(agents: &[AgentSpec], ledger: HeartbeatLedger, metrics: SharedMetrics) -> Self {
        let agents_by_topic = agents
            .iter()
            .map(|a| (a.heartbeat_topic.clone(), a.id.clone()))
            .collect();
        Self {
            agents_by_topic,
            ledger,
            metrics,
        }
    }

    /// Enregistre le heartbeat ; renvoie l'agent concerné
    pub fn observe(&self, msg: &Message) -> Option<&str> {
        let Some(agent_id) = self.agents_by_topic.get(&msg.topic) else {
            debug!(topic = %msg.topic, "heartbeat on unknown topic ignored");
            return None;
        };
        self.ledger.record(agent_id);
        self.metrics.record_heartbeat();
        Some(agent_id.as_str())
    }
}

impl Dispatch for HeartbeatListener {
    fn name(&self) -> String {
        "heartbeats".into()
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.agents_by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn dispatch(&self, msg: Message) {
        self.observe(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::models::WatchTier;
    use std::sync::Arc;

    fn listener() -> (HeartbeatListener, HeartbeatLedger, SharedMetrics) {
        let ledger = HeartbeatLedger::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let agents = [
            AgentSpec::new("eva.banker", WatchTier::Critical),
            AgentSpec::new("eva.core", WatchTier::Warning),
        ];
        (
            HeartbeatListener::new(&agents, ledger.clone(), metrics.clone()),
            ledger,
            metrics,
        )
    }

    #[test]
    fn any_payload_counts_as_a_heartbeat() {
        let (listener, ledger, metrics) = listener();

        assert_eq!(listener.observe(&Message::new("eva.banker.heartbeat", Vec::new())), Some("eva.banker"));
        assert_eq!(listener.observe(&Message::new("eva.banker.heartbeat", b"not json".to_vec())), Some("eva.banker"));

        assert!(ledger.last_seen("eva.banker").is_some());
        assert_eq!(ledger.last_seen("eva.core"), None);
        assert_eq!(metrics.counters().heartbeats_received, 2);
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let (listener, ledger, metrics) = listener();
        assert_eq!(listener.observe(&Message::new("eva.muse.heartbeat", b"{}".to_vec())), None);
        assert!(ledger.is_empty());
        assert_eq!(metrics.counters().heartbeats_received, 0);
    }

    #[test]
    fn subscribes_to_one_topic_per_agent() {
        let (listener, _, _) = listener();
        assert_eq!(listener.topics(), ["eva.banker.heartbeat", "eva.core.heartbeat"]);
    }
}
