/**
 * NERVOUS SYSTEM - Routage par priorité et surveillance de vie de la ruche
 *
 * RÔLE :
 * Colonne vertébrale du runtime multi-agents : reçoit les événements du
 * broker, les classe par tier (P0 danger, P1 trade, P2 swarm), les répartit
 * vers les bons consommateurs, suit les heartbeats des agents et expose un
 * snapshot opérationnel.
 *
 * TÂCHES (une par rôle, toutes arrêtées par le même jeton d'annulation) :
 * - 3 routeurs de tier + 1 heartbeat listener (boucles d'abonnement supervisées)
 * - 1 watchdog (sweep périodique)
 * - 1 alive reporter (log périodique des compteurs)
 *
 * Le ledger et les métriques sont des handles partagés passés explicitement,
 * aucune statique globale.
 */

pub mod broker;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod router;
pub mod status;
pub mod supervisor;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use broker::{wait_for_broker, Broker, MqttBroker, Subscription};
pub use config::{NervousConfig, Topology};
pub use error::{ConfigError, NervousError, Result, TransportError};
pub use ledger::HeartbeatLedger;
pub use metrics::{Metrics, SharedMetrics};
pub use models::{ControlMessage, Message, Tier};
pub use status::{StatusAggregator, StatusSnapshot};

use crate::heartbeat::HeartbeatListener;
use crate::router::PriorityRouter;
use crate::supervisor::{Dispatch, SubscriptionLoop};
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Assemblage complet du nervous system sur un broker donné
pub struct Hive<B> {
    broker: B,
    topology: Topology,
    ledger: HeartbeatLedger,
    metrics: SharedMetrics,
    status: StatusAggregator,
    cancel: CancellationToken,
}

impl<B: Broker> Hive<B> {
    pub fn new(broker: B, topology: Topology, cancel: CancellationToken) -> Result<Self> {
        topology.validate()?;
        let ledger = HeartbeatLedger::new();
        let metrics = Arc::new(Metrics::new()?);
        let status = StatusAggregator::new(ledger.clone(), metrics.clone(), topology.timing.thresholds());
        Ok(Self {
            broker,
            topology,
            ledger,
            metrics,
            status,
            cancel,
        })
    }

    pub fn ledger(&self) -> &HeartbeatLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }

    /// État partagé pour la surface HTTP
    pub fn app_state(&self) -> http::AppState {
        http::AppState {
            status: self.status.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Démarre toutes les tâches de fond. Le broker doit déjà être joignable.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let timing = &self.topology.timing;
        let mut tasks = Vec::new();

        for route in self.topology.priority_routes() {
            let router = PriorityRouter::new(route, self.broker.clone(), self.metrics.clone());
            tasks.push(self.supervise(router));
        }

        let agents = self.topology.agents();
        if !agents.is_empty() {
            let listener = HeartbeatListener::new(&agents, self.ledger.clone(), self.metrics.clone());
            tasks.push(self.supervise(listener));
        }

        let watchdog = Watchdog::new(
            self.broker.clone(),
            self.ledger.clone(),
            self.metrics.clone(),
            agents,
            timing.thresholds(),
            self.topology.control_topic.clone(),
        )
        .alert_on_unseen(self.topology.alert_on_unseen);
        tasks.push(tokio::spawn(watchdog.run(timing.sweep(), self.cancel.clone())));

        tasks.push(tokio::spawn(report_alive(
            self.metrics.clone(),
            timing.alive(),
            self.cancel.clone(),
        )));

        info!(tasks = tasks.len(), "nervous system online");
        tasks
    }

    /// Démarre les tâches et attend leur fin (annulation du jeton)
    pub async fn run(&self) {
        for res in futures::future::join_all(self.spawn()).await {
            if let Err(e) = res {
                error!(error = %e, "task ended abnormally");
            }
        }
    }

    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
    }

    fn supervise<D: Dispatch>(&self, dispatch: D) -> JoinHandle<()> {
        let state = self.metrics.connection(&dispatch.name());
        let lp = SubscriptionLoop::new(
            self.broker.clone(),
            dispatch,
            self.topology.timing.resubscribe(),
            state,
            self.cancel.clone(),
        );
        tokio::spawn(lp.run())
    }
}

async fn report_alive(metrics: SharedMetrics, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let c = metrics.counters();
                info!(
                    routed = c.total_messages_routed,
                    heartbeats = c.heartbeats_received,
                    errors = c.errors_total,
                    "nervous system alive"
                );
            }
        }
    }
}
