/**
 * SUPERVISOR - Machine d'état de reconnexion des boucles d'abonnement
 *
 * DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED -> ...
 *
 * Commun aux routeurs de tier et au heartbeat listener : abonnement, drain du
 * flux message par message, puis pause à intervalle fixe (pas de backoff
 * croissant) et réabonnement quand le flux se ferme. Chaque point de
 * suspension est mis en concurrence avec le jeton d'annulation.
 */

use crate::broker::Broker;
use crate::models::{ConnectionCell, ConnectionState, Message};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Consommateur d'une boucle d'abonnement
pub trait Dispatch: Send + Sync + 'static {
    /// Nom de la boucle dans les logs et le snapshot
    fn name(&self) -> String;

    fn topics(&self) -> Vec<String>;

    /// Traite un message ; jamais interrompu en cours de route
    fn dispatch(&self, msg: Message) -> impl Future<Output = ()> + Send;
}

enum Step {
    Received(Message),
    Closed,
    Cancelled,
}

pub struct SubscriptionLoop<B, D> {
    broker: B,
    dispatch: D,
    retry: Duration,
    state: ConnectionCell,
    cancel: CancellationToken,
}

impl<B: Broker, D: Dispatch> SubscriptionLoop<B, D> {
    pub fn new(
        broker: B,
        dispatch: D,
        retry: Duration,
        state: ConnectionCell,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            dispatch,
            retry,
            state,
            cancel,
        }
    }

    pub async fn run(self) {
        let name = self.dispatch.name();
        let topics = self.dispatch.topics();

        'reconnect: loop {
            self.state.set(ConnectionState::Connecting);
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break 'reconnect,
                res = self.broker.subscribe(topics.clone()) => res,
            };

            match subscribed {
                Ok(mut sub) => {
                    self.state.set(ConnectionState::Connected);
                    info!(task = %name, ?topics, "subscribed");

                    loop {
                        let step = tokio::select! {
                            _ = self.cancel.cancelled() => Step::Cancelled,
                            next = sub.next() => next.map_or(Step::Closed, Step::Received),
                        };
                        match step {
                            Step::Received(msg) => self.dispatch.dispatch(msg).await,
                            Step::Closed => break,
                            Step::Cancelled => {
                                sub.close();
                                break 'reconnect;
                            }
                        }
                    }

                    warn!(task = %name, "channel closed, reconnecting...");
                    sub.close();
                }
                Err(e) => warn!(task = %name, error = %e, "subscribe failed"),
            }

            self.state.set(ConnectionState::Disconnected);
            tokio::select! {
                _ = self.cancel.cancelled() => break 'reconnect,
                _ = sleep(self.retry) => {}
            }
        }

        self.state.set(ConnectionState::Disconnected);
        info!(task = %name, "stopped");
    }
}
