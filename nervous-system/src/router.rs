/**
 * PRIORITY ROUTER - Un routeur générique par tier (P0 danger, P1 trade, P2 swarm)
 *
 * Par message :
 * 1. instant de réception
 * 2. compteur du tier + total routé
 * 3. rendu des copies selon la PriorityRoute, publications concurrentes
 *    et indépendantes (aucun ordre garanti entre destinations)
 * 4. latence depuis la réception, étiquetée par topic source
 *
 * Un échec de publication est compté puis abandonné : le rejouer pourrait
 * dupliquer une activation du kill-switch ou un ordre.
 */

use crate::broker::Broker;
use crate::metrics::SharedMetrics;
use crate::models::{Message, PriorityRoute, Tier};
use crate::supervisor::Dispatch;
use futures::future::join_all;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Résultat du routage d'un message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

pub struct PriorityRouter<B> {
    route: PriorityRoute,
    broker: B,
    metrics: SharedMetrics,
}

impl<B: Broker> PriorityRouter<B> {
    pub fn new(route: PriorityRoute, broker: B, metrics: SharedMetrics) -> Self {
        Self {
            route,
            broker,
            metrics,
        }
    }

    pub async fn route(&self, msg: Message) -> RouteOutcome {
        let start = Instant::now();
        let tier = self.route.tier;

        // jamais de livraison croisée entre tiers
        if !self.route.accepts(&msg.topic) {
            debug!(%tier, channel = %msg.topic, "message outside tier, ignored");
            return RouteOutcome::default();
        }

        self.metrics.record_received(tier);
        match tier {
            Tier::P0 => info!(%tier, channel = %msg.topic, bytes = msg.payload.len(), "DANGER, routing to kill switch"),
            _ => debug!(%tier, channel = %msg.topic, bytes = msg.payload.len(), "routing"),
        }

        let outbound = match self.route.render(&msg) {
            Ok(outbound) => outbound,
            Err(e) => {
                self.metrics.record_error();
                error!(%tier, channel = %msg.topic, error = %e, "failed to render control message");
                return RouteOutcome {
                    elapsed: start.elapsed(),
                    ..RouteOutcome::default()
                };
            }
        };

        let broker = &self.broker;
        let results = join_all(outbound.into_iter().map(|copy| async move {
            let res = broker.publish(&copy.topic, copy.payload).await;
            (copy.topic, res)
        }))
        .await;

        let mut outcome = RouteOutcome::default();
        for (destination, res) in results {
            match res {
                Ok(()) => {
                    self.metrics.record_forwarded(tier, &destination);
                    outcome.delivered += 1;
                }
                Err(e) => {
                    self.metrics.record_error();
                    outcome.failed += 1;
                    error!(%tier, channel = %msg.topic, %destination, error = %e, "forward dropped");
                }
            }
        }

        outcome.elapsed = start.elapsed();
        self.metrics.record_routed(tier, &msg.topic, outcome.elapsed);
        debug!(%tier, channel = %msg.topic, elapsed = ?outcome.elapsed, "routed");
        outcome
    }
}

impl<B: Broker> Dispatch for PriorityRouter<B> {
    fn name(&self) -> String {
        format!("router/{}", self.route.tier.name())
    }

    fn topics(&self) -> Vec<String> {
        self.route.source_topics.iter().cloned().collect()
    }

    async fn dispatch(&self, msg: Message) {
        self.route(msg).await;
    }
}
