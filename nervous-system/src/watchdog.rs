/**
 * WATCHDOG - Surveillance du heartbeat de chaque agent
 *
 * Piloté par un timer (pas par l'arrivée des messages). À chaque sweep :
 * - agent critique silencieux > seuil critique : compteur d'erreurs +1 et
 *   WATCHDOG_ALERT publié sur le topic de contrôle. Alarme sur niveau : une
 *   alerte par sweep tant que l'agent reste muet (signal "toujours down").
 * - agent warning silencieux > seuil warning : log local uniquement.
 * - agent jamais entendu : ignoré (sauf alert_on_unseen pour les critiques).
 *
 * La classification est une fonction pure de (now, last_seen, seuils).
 */

use crate::broker::Broker;
use crate::ledger::HeartbeatLedger;
use crate::metrics::SharedMetrics;
use crate::models::{AgentSpec, ControlMessage, WatchTier};
use serde::Serialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Au-delà : alerte pour un agent critique, fin de la zone ONLINE
    pub critical: Duration,
    /// Au-delà : warning pour un agent warning, zone OFFLINE
    pub warning: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical: Duration::from_secs(10),
            warning: Duration::from_secs(30),
        }
    }
}

/// Ordonné du meilleur au pire état
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Liveness {
    Online,
    Degraded,
    Offline,
}

/// Temps écoulé depuis le dernier heartbeat ; une horloge en avance compte pour zéro
pub fn elapsed_since(now: OffsetDateTime, last_seen: OffsetDateTime) -> Duration {
    (now - last_seen).try_into().unwrap_or(Duration::ZERO)
}

pub fn classify(elapsed: Duration, thresholds: &Thresholds) -> Liveness {
    if elapsed < thresholds.critical {
        Liveness::Online
    } else if elapsed < thresholds.warning {
        Liveness::Degraded
    } else {
        Liveness::Offline
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Agents critiques ayant déclenché une alerte
    pub alerts: Vec<String>,
    /// Agents warning silencieux
    pub warnings: Vec<String>,
}

pub struct Watchdog<B> {
    broker: B,
    ledger: HeartbeatLedger,
    metrics: SharedMetrics,
    agents: Vec<AgentSpec>,
    thresholds: Thresholds,
    control_topic: String,
    alert_on_unseen: bool,
}

impl<B: Broker> Watchdog<B> {
    pub fn new(
        broker: B,
        ledger: HeartbeatLedger,
        metrics: SharedMetrics,
        agents: Vec<AgentSpec>,
        thresholds: Thresholds,
        control_topic: String,
    ) -> Self {
        Self {
            broker,
            ledger,
            metrics,
            agents,
            thresholds,
            control_topic,
            alert_on_unseen: false,
        }
    }

    pub fn alert_on_unseen(mut self, enabled: bool) -> Self {
        self.alert_on_unseen = enabled;
        self
    }

    pub async fn sweep(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();

        for agent in &self.agents {
            let last_seen = self.ledger.last_seen(&agent.id);
            match (agent.watch, last_seen) {
                (WatchTier::Critical, Some(seen)) => {
                    let silent = elapsed_since(now, seen);
                    if silent > self.thresholds.critical {
                        error!(agent = %agent.id, silent_for = %round_secs(silent), "WATCHDOG: heartbeat lost, alerting kernel");
                        self.raise(&agent.id, Some(seen)).await;
                        report.alerts.push(agent.id.clone());
                    }
                }
                (WatchTier::Critical, None) if self.alert_on_unseen => {
                    error!(agent = %agent.id, "WATCHDOG: critical agent never heard from");
                    self.raise(&agent.id, None).await;
                    report.alerts.push(agent.id.clone());
                }
                (WatchTier::Warning, Some(seen)) => {
                    let silent = elapsed_since(now, seen);
                    if silent > self.thresholds.warning {
                        warn!(agent = %agent.id, silent_for = %round_secs(silent), "WATCHDOG: agent silent");
                        report.warnings.push(agent.id.clone());
                    }
                }
                _ => {}
            }
        }
        report
    }

    async fn raise(&self, agent: &str, last_seen: Option<OffsetDateTime>) {
        self.metrics.record_error();

        let alert = ControlMessage::WatchdogAlert {
            agent: agent.to_string(),
            last_seen: last_seen.and_then(|t| t.format(&Rfc3339).ok()),
        };
        let body = match serde_json::to_vec(&alert) {
            Ok(body) => body,
            Err(e) => {
                error!(%agent, error = %e, "failed to encode watchdog alert");
                return;
            }
        };
        if let Err(e) = self.broker.publish(&self.control_topic, body).await {
            self.metrics.record_error();
            error!(%agent, error = %e, "failed to publish watchdog alert");
        }
    }

    /// Premier sweep une période après le démarrage
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        info!(period = ?period, agents = self.agents.len(), "watchdog started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(OffsetDateTime::now_utc()).await;
                    debug!(alerts = report.alerts.len(), warnings = report.warnings.len(), "sweep done");
                }
            }
        }
        info!("watchdog stopped");
    }
}

fn round_secs(d: Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_secs(d.as_secs()))
}
