/**
 * METRICS - Compteurs du routeur et export Prometheus
 *
 * Deux vues sur les mêmes événements :
 * - compteurs atomiques lus par le snapshot /health
 * - registre Prometheus possédé (pas de statique globale) exporté sur /metrics
 */

use crate::error::NervousError;
use crate::models::{ConnectionCell, ConnectionState, Tier};
use dashmap::DashMap;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Valeurs des compteurs à un instant donné
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub danger_signals: u64,
    pub trade_signals: u64,
    pub swarm_events: u64,
    pub heartbeats_received: u64,
    pub total_messages_routed: u64,
    pub errors_total: u64,
}

pub struct Metrics {
    started: Instant,
    danger_signals: AtomicU64,
    trade_signals: AtomicU64,
    swarm_events: AtomicU64,
    heartbeats: AtomicU64,
    routed: AtomicU64,
    errors: AtomicU64,
    connections: DashMap<String, ConnectionCell>,

    registry: Registry,
    messages_routed: IntCounterVec,
    messages_forwarded: IntCounterVec,
    routing_latency: HistogramVec,
    errors_counter: IntCounter,
    heartbeats_counter: IntCounter,
}

pub type SharedMetrics = Arc<Metrics>;

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_routed = IntCounterVec::new(
            Opts::new("nervous_messages_routed_total", "The total number of routed messages"),
            &["channel", "priority"],
        )?;
        let messages_forwarded = IntCounterVec::new(
            Opts::new(
                "nervous_messages_forwarded_total",
                "Copies successfully handed to the broker, per destination",
            ),
            &["destination", "priority"],
        )?;
        let routing_latency = HistogramVec::new(
            HistogramOpts::new(
                "nervous_routing_latency_seconds",
                "Latency of message routing in seconds",
            ),
            &["channel"],
        )?;
        let errors_counter = IntCounter::new("nervous_errors_total", "The total number of errors encountered")?;
        let heartbeats_counter =
            IntCounter::new("nervous_heartbeats_received_total", "Agent heartbeats received")?;

        registry.register(Box::new(messages_routed.clone()))?;
        registry.register(Box::new(messages_forwarded.clone()))?;
        registry.register(Box::new(routing_latency.clone()))?;
        registry.register(Box::new(errors_counter.clone()))?;
        registry.register(Box::new(heartbeats_counter.clone()))?;

        Ok(Self {
            started: Instant::now(),
            danger_signals: AtomicU64::new(0),
            trade_signals: AtomicU64::new(0),
            swarm_events: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            routed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connections: DashMap::new(),
            registry,
            messages_routed,
            messages_forwarded,
            routing_latency,
            errors_counter,
            heartbeats_counter,
        })
    }

    /// Réception d'un message sur un tier (avant le forward)
    pub fn record_received(&self, tier: Tier) {
        let counter = match tier {
            Tier::P0 => &self.danger_signals,
            Tier::P1 => &self.trade_signals,
            Tier::P2 => &self.swarm_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fin du routage d'un message : compteur par canal + latence
    pub fn record_routed(&self, tier: Tier, channel: &str, elapsed: Duration) {
        self.messages_routed
            .with_label_values(&[channel, tier.priority()])
            .inc();
        self.routing_latency
            .with_label_values(&[channel])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_forwarded(&self, tier: Tier, destination: &str) {
        self.messages_forwarded
            .with_label_values(&[destination, tier.priority()])
            .inc();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_counter.inc();
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        self.heartbeats_counter.inc();
    }

    /// Cellule d'état de connexion d'une boucle d'abonnement (créée au besoin)
    pub fn connection(&self, name: &str) -> ConnectionCell {
        self.connections
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn connection_states(&self) -> BTreeMap<String, ConnectionState> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect()
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            danger_signals: self.danger_signals.load(Ordering::Relaxed),
            trade_signals: self.trade_signals.load(Ordering::Relaxed),
            swarm_events: self.swarm_events.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats.load(Ordering::Relaxed),
            total_messages_routed: self.routed.load(Ordering::Relaxed),
            errors_total: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Format d'exposition texte Prometheus
    pub fn export(&self) -> Result<String, NervousError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_messages_count_per_tier_and_in_total() {
        let metrics = Metrics::new().unwrap();
        metrics.record_received(Tier::P0);
        metrics.record_received(Tier::P1);
        metrics.record_received(Tier::P1);
        metrics.record_received(Tier::P2);

        let c = metrics.counters();
        assert_eq!(c.danger_signals, 1);
        assert_eq!(c.trade_signals, 2);
        assert_eq!(c.swarm_events, 1);
        assert_eq!(c.total_messages_routed, 4);
        assert_eq!(c.errors_total, 0);
    }

    #[test]
    fn export_contains_labelled_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_routed(Tier::P0, "danger_signal", Duration::from_micros(250));
        metrics.record_forwarded(Tier::P0, "kernel_action");
        metrics.record_error();
        metrics.record_heartbeat();

        let text = metrics.export().unwrap();
        assert!(text.contains(r#"nervous_messages_routed_total{channel="danger_signal",priority="P0"} 1"#));
        assert!(text.contains(r#"nervous_messages_forwarded_total{destination="kernel_action",priority="P0"} 1"#));
        assert!(text.contains(r#"nervous_routing_latency_seconds_count{channel="danger_signal"} 1"#));
        assert!(text.contains("nervous_errors_total 1"));
        assert!(text.contains("nervous_heartbeats_received_total 1"));
    }

    #[test]
    fn connection_cells_are_shared_by_name() {
        let metrics = Metrics::new().unwrap();
        let cell = metrics.connection("router/danger");
        cell.set(ConnectionState::Connected);

        assert_eq!(metrics.connection("router/danger").get(), ConnectionState::Connected);
        assert_eq!(
            metrics.connection_states().get("router/danger"),
            Some(&ConnectionState::Connected)
        );
    }
}
