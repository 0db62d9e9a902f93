/**
 * BROKER - Connexion au bus pub/sub de la ruche (MQTT via rumqttc)
 *
 * RÔLE :
 * - `ping`      : sonde de disponibilité (CONNACK reçu dans le délai)
 * - `subscribe` : séquence de messages paresseuse, infinie, relançable.
 *                 Fin de séquence = transport perdu, l'appelant se réabonne.
 * - `publish`   : fire-and-forget QoS 0, échoue si le transport refuse la requête
 *
 * Le trait `Broker` permet de brancher un broker en mémoire pour les tests.
 */

use crate::config::BrokerConf;
use crate::error::{NervousError, TransportError};
use crate::models::Message;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacité du canal entre la pompe MQTT et la boucle d'abonnement
pub const SUBSCRIPTION_BUFFER: usize = 256;
const PUBLISH_QUEUE: usize = 1024;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

pub trait Broker: Clone + Send + Sync + 'static {
    /// Sonde de disponibilité du broker
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ouvre un abonnement sur un ensemble de topics
    fn subscribe(
        &self,
        topics: Vec<String>,
    ) -> impl Future<Output = Result<Subscription, TransportError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Handle d'abonnement : `next()` renvoie `None` quand le flux est fermé
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// `pump` est la tâche qui alimente le canal, stoppée à la fermeture
    pub fn new(rx: mpsc::Receiver<Message>, pump: Option<JoinHandle<()>>) -> Self {
        Self { rx, pump }
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn close(mut self) {
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Bloque jusqu'à ce que le broker réponde, une tentative par intervalle.
/// Aucune boucle de routage ne démarre avant le retour de cette fonction.
pub async fn wait_for_broker<B: Broker>(
    broker: &B,
    retry: Duration,
    cancel: &CancellationToken,
) -> Result<(), NervousError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let probe = tokio::select! {
            _ = cancel.cancelled() => return Err(NervousError::Cancelled),
            probe = broker.ping() => probe,
        };
        match probe {
            Ok(()) => {
                info!(attempt, "broker reachable");
                return Ok(());
            }
            Err(e) => warn!(attempt, error = %e, "waiting for broker..."),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(NervousError::Cancelled),
            _ = sleep(retry) => {}
        }
    }
}

/// Broker MQTT : un client publisher partagé + un client dédié par abonnement
#[derive(Clone)]
pub struct MqttBroker {
    conf: Arc<BrokerConf>,
    publisher: AsyncClient,
    connect_timeout: Duration,
}

impl MqttBroker {
    /// Crée le client publisher et démarre la tâche qui pilote sa connexion
    pub fn start(
        conf: BrokerConf,
        connect_timeout: Duration,
        retry: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let client_id = format!("{}-pub", conf.client_id);
        let (publisher, eventloop) = AsyncClient::new(mqtt_options(&conf, &client_id), PUBLISH_QUEUE);
        tokio::spawn(drive_publisher(eventloop, retry, cancel));

        Self {
            conf: Arc::new(conf),
            publisher,
            connect_timeout,
        }
    }

    fn unique_client_id(&self, role: &str) -> String {
        // un id neuf par connexion : une session précédente pas encore expirée
        // côté broker ne doit pas éjecter la nouvelle
        format!("{}-{}-{}", self.conf.client_id, role, Uuid::new_v4().simple())
    }
}

impl Broker for MqttBroker {
    async fn ping(&self) -> Result<(), TransportError> {
        let client_id = self.unique_client_id("probe");
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&self.conf, &client_id), 1);
        await_connack(&mut eventloop, self.connect_timeout).await?;

        // DISCONNECT propre : la requête n'est émise qu'au prochain poll
        if client.try_disconnect().is_ok() {
            let _ = timeout(self.connect_timeout, eventloop.poll()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<Subscription, TransportError> {
        let client_id = self.unique_client_id("sub");
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&self.conf, &client_id), 16);
        await_connack(&mut eventloop, self.connect_timeout).await?;

        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtMostOnce));
        client
            .subscribe_many(filters)
            .await
            .map_err(|e| TransportError::SubscribeRejected {
                topics: topics.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pump = tokio::spawn(pump_publishes(client, eventloop, tx));
        Ok(Subscription::new(rx, Some(pump)))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // try_publish : une file pleine (broker coupé) échoue tout de suite
        // au lieu de bloquer la boucle de routage
        self.publisher
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

fn mqtt_options(conf: &BrokerConf, client_id: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_clean_session(true);
    if let Some(password) = &conf.password {
        opts.set_credentials(&conf.username, password);
    }
    opts
}

async fn await_connack(eventloop: &mut EventLoop, limit: Duration) -> Result<(), TransportError> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(TransportError::Unreachable(format!(
                            "connection refused: {code:?}"
                        ))),
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Unreachable(e.to_string())),
            }
        }
    };
    timeout(limit, handshake)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

/// Pompe les PUBLISH entrants vers le canal ; s'arrête à la première erreur transport
async fn pump_publishes(client: AsyncClient, mut eventloop: EventLoop, tx: mpsc::Sender<Message>) {
    // le client doit vivre aussi longtemps que l'eventloop
    let _client = client;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(pkid = ack.pkid, "broker refused part of the subscription");
                    break;
                }
                debug!(pkid = ack.pkid, "subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "subscription stream closed");
                break;
            }
        }
    }
}

async fn drive_publisher(mut eventloop: EventLoop, retry: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("publisher connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "publisher connection lost, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(retry) => {}
                    }
                }
            }
        }
    }
    debug!("publisher driver stopped");
}
