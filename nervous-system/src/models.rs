use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Les trois classes de priorité fixes de la ruche
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "danger")]
    P0,
    #[serde(rename = "trade")]
    P1,
    #[serde(rename = "swarm")]
    P2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::P0, Tier::P1, Tier::P2];

    /// Nom du canal ("danger", "trade", "swarm")
    pub fn name(self) -> &'static str {
        match self {
            Tier::P0 => "danger",
            Tier::P1 => "trade",
            Tier::P2 => "swarm",
        }
    }

    /// Label `priority` des métriques Prometheus
    pub fn priority(self) -> &'static str {
        match self {
            Tier::P0 => "P0",
            Tier::P1 => "P1",
            Tier::P2 => "P2",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.priority(), self.name())
    }
}

/// Message brut reçu du broker : payload opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Messages de contrôle publiés sur le topic d'action du kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ControlMessage {
    #[serde(rename = "ACTIVATE_KILL_SWITCH")]
    ActivateKillSwitch { source: String, payload: Value },
    #[serde(rename = "WATCHDOG_ALERT")]
    WatchdogAlert {
        agent: String,
        last_seen: Option<String>,
    },
}

impl ControlMessage {
    pub fn kill_switch(source: &str, raw: &[u8]) -> Self {
        ControlMessage::ActivateKillSwitch {
            source: source.to_string(),
            payload: embed_payload(raw),
        }
    }
}

/// Le payload d'origine est intégré tel quel s'il est du JSON valide,
/// sinon comme chaîne (octets non UTF-8 remplacés).
pub fn embed_payload(raw: &[u8]) -> Value {
    serde_json::from_slice::<Value>(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadTransform {
    /// Payload transmis sans modification
    #[default]
    Passthrough,
    /// Payload enveloppé dans un ACTIVATE_KILL_SWITCH
    KillSwitch,
}

/// Copie à publier vers une destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Configuration déclarative d'un tier : sources, destinations, transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityRoute {
    pub tier: Tier,
    pub source_topics: BTreeSet<String>,
    pub destinations: Vec<String>,
    pub transform: PayloadTransform,
}

impl PriorityRoute {
    pub fn new<S, D>(tier: Tier, sources: S, destinations: D, transform: PayloadTransform) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            tier,
            source_topics: sources.into_iter().map(Into::into).collect(),
            destinations: destinations.into_iter().map(Into::into).collect(),
            transform,
        }
    }

    pub fn accepts(&self, topic: &str) -> bool {
        self.source_topics.contains(topic)
    }

    /// Une copie par destination ; l'ordre de publication n'est pas garanti
    pub fn render(&self, msg: &Message) -> Result<Vec<Outbound>, serde_json::Error> {
        let body = match self.transform {
            PayloadTransform::Passthrough => msg.payload.clone(),
            PayloadTransform::KillSwitch => {
                serde_json::to_vec(&ControlMessage::kill_switch(&msg.topic, &msg.payload))?
            }
        };
        Ok(self
            .destinations
            .iter()
            .map(|topic| Outbound {
                topic: topic.clone(),
                payload: body.clone(),
            })
            .collect())
    }
}

/// Palier de surveillance d'un agent par le watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchTier {
    Critical,
    Warning,
    /// Suivi dans le snapshot uniquement
    Unwatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub id: String,
    pub heartbeat_topic: String,
    pub watch: WatchTier,
}

impl AgentSpec {
    pub fn new(id: &str, watch: WatchTier) -> Self {
        Self {
            id: id.to_string(),
            heartbeat_topic: format!("{id}.heartbeat"),
            watch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Cellule atomique partagée entre une boucle d'abonnement et le snapshot
#[derive(Debug, Clone)]
pub struct ConnectionCell(Arc<AtomicU8>);

impl ConnectionCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    pub fn set(&self, state: ConnectionState) {
        let raw = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        };
        self.0.store(raw, Ordering::Release);
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn danger_route() -> PriorityRoute {
        PriorityRoute::new(
            Tier::P0,
            ["danger_signal", "eva.sentinel.alert"],
            ["kernel_action"],
            PayloadTransform::KillSwitch,
        )
    }

    #[test]
    fn kill_switch_embeds_json_payload() {
        let msg = Message::new("danger_signal", br#"{"level":9}"#.to_vec());
        let out = danger_route().render(&msg).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "kernel_action");

        let body: Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(body["action"], "ACTIVATE_KILL_SWITCH");
        assert_eq!(body["source"], "danger_signal");
        assert_eq!(body["payload"]["level"], 9);
    }

    #[test]
    fn kill_switch_keeps_non_json_payload_as_text() {
        let msg = Message::new("eva.sentinel.alert", b"drawdown breach".to_vec());
        let out = danger_route().render(&msg).unwrap();
        let parsed: ControlMessage = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(
            parsed,
            ControlMessage::ActivateKillSwitch {
                source: "eva.sentinel.alert".into(),
                payload: Value::String("drawdown breach".into()),
            }
        );
    }

    #[test]
    fn passthrough_copies_payload_to_every_destination() {
        let route = PriorityRoute::new(
            Tier::P1,
            ["trade_opportunity"],
            ["eva.banker.requests.critical", "banker_orders"],
            PayloadTransform::Passthrough,
        );
        let msg = Message::new("trade_opportunity", b"\x00raw bytes\xff".to_vec());
        let out = route.render(&msg).unwrap();

        let topics: Vec<_> = out.iter().map(|o| o.topic.as_str()).collect();
        assert_eq!(topics, ["eva.banker.requests.critical", "banker_orders"]);
        assert!(out.iter().all(|o| o.payload == msg.payload));
    }

    #[test]
    fn watchdog_alert_wire_format() {
        let alert = ControlMessage::WatchdogAlert {
            agent: "eva.banker".into(),
            last_seen: Some("2026-01-01T00:00:00Z".into()),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "WATCHDOG_ALERT",
                "agent": "eva.banker",
                "last_seen": "2026-01-01T00:00:00Z"
            })
        );
    }

    #[test]
    fn connection_cell_round_trips_states() {
        let cell = ConnectionCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        cell.set(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);
        cell.clone().set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn agent_spec_derives_heartbeat_topic() {
        let spec = AgentSpec::new("eva.core", WatchTier::Warning);
        assert_eq!(spec.heartbeat_topic, "eva.core.heartbeat");
    }
}
