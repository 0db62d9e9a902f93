/*!
Test Harness pour le nervous system

Démarre une ruche complète sur un `MockBroker` avec des temporisations
courtes, et fournit les helpers d'attente et d'assertion des scénarios.
*/

use crate::mqtt_stub::MockBroker;
use anyhow::{bail, Context, Result};
use nervous_system::config::Timing;
use nervous_system::models::ConnectionState;
use nervous_system::{wait_for_broker, Hive, Message, StatusSnapshot, Topology};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLL: Duration = Duration::from_millis(10);
/// Délai par défaut des attentes du harness
pub const WAIT: Duration = Duration::from_secs(3);

/// Ruche complète branchée sur un broker en mémoire
pub struct TestHarness {
    pub broker: MockBroker,
    hive: Hive<MockBroker>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Topologie par défaut de la ruche, temporisations en millisecondes
    pub fn fast_topology() -> Topology {
        Topology {
            timing: Timing {
                connect_retry_ms: 20,
                connect_timeout_ms: 200,
                resubscribe_ms: 20,
                sweep_ms: 50,
                critical_ms: 200,
                warning_ms: 400,
                alive_ms: 1_000,
            },
            ..Topology::default()
        }
    }

    pub async fn start() -> Result<Self> {
        Self::start_with(MockBroker::new(), Self::fast_topology()).await
    }

    /// Attend le broker puis démarre toutes les tâches de la ruche
    pub async fn start_with(broker: MockBroker, topology: Topology) -> Result<Self> {
        init_tracing();

        let cancel = CancellationToken::new();
        let retry = topology.timing.connect_retry();
        timeout(WAIT, wait_for_broker(&broker, retry, &cancel))
            .await
            .context("mock broker never became reachable")??;

        let hive = Hive::new(broker.clone(), topology, cancel)?;
        let tasks = hive.spawn();
        let harness = Self {
            broker,
            hive,
            tasks,
        };
        harness.wait_connected(WAIT).await?;
        info!("test hive ready");
        Ok(harness)
    }

    pub fn hive(&self) -> &Hive<MockBroker> {
        &self.hive
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.hive.status().snapshot()
    }

    /// Simule un message entrant ; échoue si aucune boucle n'écoute ce topic
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        if self.broker.inject(topic, payload) == 0 {
            bail!("no subscriber for topic {topic}");
        }
        Ok(())
    }

    pub fn inject_json(&self, topic: &str, payload: &Value) -> Result<()> {
        self.inject(topic, serde_json::to_vec(payload)?)
    }

    /// Attend que toutes les boucles d'abonnement soient CONNECTED
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let metrics = self.hive.metrics().clone();
        let connected = wait_until(limit, || {
            let states = metrics.connection_states();
            !states.is_empty() && states.values().all(|s| *s == ConnectionState::Connected)
        })
        .await;
        if !connected {
            bail!("subscription loops not connected: {:?}", self.hive.metrics().connection_states());
        }
        Ok(())
    }

    /// Attend au moins `count` publications sur un topic
    pub async fn wait_for_messages(&self, topic: &str, count: usize, limit: Duration) -> Result<Vec<Message>> {
        let broker = self.broker.clone();
        if wait_until(limit, || broker.published_to(topic).len() >= count).await {
            return Ok(self.broker.published_to(topic));
        }
        let got = self.broker.published_to(topic).len();
        warn!(topic, expected = count, got, "timeout waiting for messages");
        bail!("expected {count} messages on {topic}, got {got}");
    }

    /// Assert qu'un champ (chemin pointé) du dernier message JSON a la valeur attendue
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.broker.last_json(topic)? else {
            bail!("no message on {topic}");
        };
        match nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => bail!("field '{field_path}' mismatch: expected {expected:?}, got {actual:?}"),
            None => bail!("field '{field_path}' not found in latest message on {topic}"),
        }
    }

    /// Annule la ruche et attend la fin de toutes ses tâches
    pub async fn shutdown(self) -> Result<()> {
        self.hive.shutdown();
        for task in self.tasks {
            timeout(WAIT, task)
                .await
                .context("task did not stop after cancellation")??;
        }
        Ok(())
    }
}

/// Sonde une condition toutes les 10ms jusqu'au délai
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL).await;
    }
}

fn nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

fn init_tracing() {
    // Ok si déjà initialisé par un autre test
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init()
        .ok();
}
