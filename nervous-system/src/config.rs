/**
 * CONFIGURATION - Environnement + topologie YAML optionnelle
 *
 * Environnement (avec .env si présent) : BROKER_HOST, BROKER_PORT,
 * BROKER_USERNAME, BROKER_PASSWORD, BROKER_CLIENT_ID, HEALTH_PORT.
 * Topologie (NERVOUS_CONFIG, défaut nervous.yaml) : topics par tier, agents,
 * temporisations. Fichier absent = topologie par défaut de la ruche.
 */

use crate::error::ConfigError;
use crate::models::{AgentSpec, PayloadTransform, PriorityRoute, Tier, WatchTier};
use crate::watchdog::Thresholds;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConf {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Vide = connexion sans credentials
    pub password: Option<String>,
    pub client_id: String,
}

impl Default for BrokerConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: "nervous-system".into(),
            password: None,
            client_id: "nervous-system".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConf {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
}

impl RouteConf {
    fn new(sources: &[&str], destinations: &[&str]) -> Self {
        Self {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            destinations: destinations.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConf {
    pub danger: RouteConf,
    pub trade: RouteConf,
    pub swarm: RouteConf,
}

impl Default for RoutesConf {
    fn default() -> Self {
        Self {
            danger: RouteConf::new(
                &["danger_signal", "eva.sentinel.alert", "eva.kernel.emergency"],
                &["kernel_action"],
            ),
            trade: RouteConf::new(
                &["trade_opportunity", "eva.core.trade_request"],
                &["eva.banker.requests.critical", "banker_orders"],
            ),
            swarm: RouteConf::new(
                &["eva.swarm.events", "eva.swarm.broadcast", "eva.swarm.drone_scale"],
                &["eva.core.swarm_event", "eva.banker.swarm_event"],
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConf {
    pub id: String,
    /// Défaut : "<id>.heartbeat"
    pub heartbeat_topic: Option<String>,
    pub watch: WatchTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub connect_retry_ms: u64,
    pub connect_timeout_ms: u64,
    pub resubscribe_ms: u64,
    pub sweep_ms: u64,
    pub critical_ms: u64,
    pub warning_ms: u64,
    pub alive_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            connect_retry_ms: 2_000,
            connect_timeout_ms: 5_000,
            resubscribe_ms: 1_000,
            sweep_ms: 5_000,
            critical_ms: 10_000,
            warning_ms: 30_000,
            alive_ms: 10_000,
        }
    }
}

impl Timing {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resubscribe(&self) -> Duration {
        Duration::from_millis(self.resubscribe_ms)
    }

    pub fn sweep(&self) -> Duration {
        Duration::from_millis(self.sweep_ms)
    }

    pub fn alive(&self) -> Duration {
        Duration::from_millis(self.alive_ms)
    }

    /// Aucune période nulle (interval tokio), bande DEGRADED non vide
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("connect_retry_ms", self.connect_retry_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("resubscribe_ms", self.resubscribe_ms),
            ("sweep_ms", self.sweep_ms),
            ("critical_ms", self.critical_ms),
            ("warning_ms", self.warning_ms),
            ("alive_ms", self.alive_ms),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::InvalidTiming(format!("{key} must be greater than zero")));
        }
        if self.critical_ms >= self.warning_ms {
            return Err(ConfigError::InvalidTiming(format!(
                "critical_ms ({}) must be lower than warning_ms ({})",
                self.critical_ms, self.warning_ms
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            critical: Duration::from_millis(self.critical_ms),
            warning: Duration::from_millis(self.warning_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub control_topic: String,
    pub routes: RoutesConf,
    pub agents: Vec<AgentConf>,
    pub timing: Timing,
    /// Alerte aussi sur un agent critique jamais entendu
    pub alert_on_unseen: bool,
}

impl Default for Topology {
    fn default() -> Self {
        let agent = |id: &str, watch| AgentConf {
            id: id.into(),
            heartbeat_topic: None,
            watch,
        };
        Self {
            control_topic: "kernel_action".into(),
            routes: RoutesConf::default(),
            agents: vec![
                agent("eva.banker", WatchTier::Critical),
                agent("eva.core", WatchTier::Warning),
                agent("eva.sentinel", WatchTier::Warning),
                agent("eva.lab", WatchTier::Unwatched),
            ],
            timing: Timing::default(),
            alert_on_unseen: false,
        }
    }
}

impl Topology {
    pub fn priority_routes(&self) -> Vec<PriorityRoute> {
        Tier::ALL
            .iter()
            .map(|&tier| {
                let conf = self.route_conf(tier);
                let transform = match tier {
                    Tier::P0 => PayloadTransform::KillSwitch,
                    Tier::P1 | Tier::P2 => PayloadTransform::Passthrough,
                };
                PriorityRoute::new(
                    tier,
                    conf.sources.iter().cloned(),
                    conf.destinations.iter().cloned(),
                    transform,
                )
            })
            .collect()
    }

    pub fn agents(&self) -> Vec<AgentSpec> {
        self.agents
            .iter()
            .map(|a| AgentSpec {
                id: a.id.clone(),
                heartbeat_topic: a
                    .heartbeat_topic
                    .clone()
                    .unwrap_or_else(|| format!("{}.heartbeat", a.id)),
                watch: a.watch,
            })
            .collect()
    }

    fn route_conf(&self, tier: Tier) -> &RouteConf {
        match tier {
            Tier::P0 => &self.routes.danger,
            Tier::P1 => &self.routes.trade,
            Tier::P2 => &self.routes.swarm,
        }
    }

    /// Vérifie les invariants : tiers disjoints, pas de boucle de routage
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;
        let mut owners: HashMap<String, String> = HashMap::new();

        for tier in Tier::ALL {
            let conf = self.route_conf(tier);
            if conf.sources.is_empty() {
                return Err(ConfigError::NoSources(tier.name().into()));
            }
            if conf.destinations.is_empty() {
                return Err(ConfigError::NoDestinations(tier.name().into()));
            }
            for source in &conf.sources {
                claim(&mut owners, source, format!("route {}", tier.name()))?;
            }
        }

        let mut seen_ids = Vec::new();
        for agent in self.agents() {
            if seen_ids.contains(&agent.id) {
                return Err(ConfigError::DuplicateAgent(agent.id));
            }
            claim(&mut owners, &agent.heartbeat_topic, format!("agent {}", agent.id))?;
            seen_ids.push(agent.id);
        }

        // une destination qui est aussi une source réinjecterait ses propres messages
        for tier in Tier::ALL {
            for dest in &self.route_conf(tier).destinations {
                reject_wildcard(dest, format!("destination of {}", tier.name()))?;
                if let Some(owner) = owners.get(dest.as_str()) {
                    return Err(ConfigError::OverlappingTopic {
                        topic: dest.clone(),
                        first: owner.clone(),
                        second: format!("destination of {}", tier.name()),
                    });
                }
            }
        }
        reject_wildcard(&self.control_topic, "control topic".into())?;
        if let Some(owner) = owners.get(self.control_topic.as_str()) {
            return Err(ConfigError::OverlappingTopic {
                topic: self.control_topic.clone(),
                first: owner.clone(),
                second: "control topic".into(),
            });
        }
        Ok(())
    }
}

/// Le routeur compare les topics à l'identique : un filtre `+`/`#` ne matcherait jamais
fn reject_wildcard(topic: &str, owner: String) -> Result<(), ConfigError> {
    if topic.contains(['+', '#']) {
        return Err(ConfigError::WildcardTopic {
            topic: topic.to_string(),
            owner,
        });
    }
    Ok(())
}

fn claim(owners: &mut HashMap<String, String>, topic: &str, owner: String) -> Result<(), ConfigError> {
    reject_wildcard(topic, owner.clone())?;
    if let Some(first) = owners.get(topic) {
        return Err(ConfigError::OverlappingTopic {
            topic: topic.to_string(),
            first: first.clone(),
            second: owner,
        });
    }
    owners.insert(topic.to_string(), owner);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NervousConfig {
    pub broker: BrokerConf,
    pub health_port: u16,
    pub topology: Topology,
}

impl NervousConfig {
    /// Charge depuis l'environnement du process
    pub async fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok()).await
    }

    pub async fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConf::default();
        let broker = BrokerConf {
            host: lookup("BROKER_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "BROKER_PORT", defaults.port)?,
            username: lookup("BROKER_USERNAME").unwrap_or(defaults.username),
            password: lookup("BROKER_PASSWORD").filter(|p| !p.is_empty()),
            client_id: lookup("BROKER_CLIENT_ID").unwrap_or(defaults.client_id),
        };
        let health_port = parse_or(&lookup, "HEALTH_PORT", 9090u16)?;

        let path = lookup("NERVOUS_CONFIG").unwrap_or_else(|| "nervous.yaml".into());
        let topology = load_topology(&path).await?;
        topology.validate()?;

        Ok(Self {
            broker,
            health_port,
            topology,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

pub async fn load_topology(path: &str) -> Result<Topology, ConfigError> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no topology file, using default hive topology");
        return Ok(Topology::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(Topology::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml {
        path: path.to_string(),
        source,
    })
}
