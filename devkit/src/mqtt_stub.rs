/*!
Broker en mémoire pour tester le nervous system sans broker MQTT réel

Implémente le trait `Broker` : enregistre toutes les publications, livre les
messages aux abonnements dont un topic correspond, et permet de simuler les
pannes (broker injoignable, redémarrage qui coupe les abonnements, échec de
publication sur certains topics).
*/

use nervous_system::broker::SUBSCRIPTION_BUFFER;
use nervous_system::{Broker, Message, Subscription, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::Sender<Message>,
}

struct Inner {
    published: Mutex<Vec<Message>>,
    subscribers: Mutex<Vec<Subscriber>>,
    failing: Mutex<HashSet<String>>,
    reachable: AtomicBool,
    subscribe_calls: AtomicUsize,
}

/// Broker simulé, clonable et partagé entre le test et la ruche
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                published: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                reachable: AtomicBool::new(true),
                subscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simule un publisher externe : livre sans enregistrer.
    /// Renvoie le nombre d'abonnements atteints.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let delivered = self.deliver(&Message::new(topic, payload));
        debug!(topic, delivered, "[MOCK] injected");
        delivered
    }

    /// Redémarrage du broker : tous les flux d'abonnement se terminent
    pub fn drop_subscriptions(&self) {
        let dropped = std::mem::take(&mut *self.inner.subscribers.lock());
        debug!(count = dropped.len(), "[MOCK] subscriptions dropped");
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.drop_subscriptions();
        }
    }

    pub fn fail_publishes_to(&self, topic: &str) {
        self.inner.failing.lock().insert(topic.to_string());
    }

    pub fn restore_publishes_to(&self, topic: &str) {
        self.inner.failing.lock().remove(topic);
    }

    /// Toutes les publications réussies, dans l'ordre
    pub fn published(&self) -> Vec<Message> {
        self.inner.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message JSON publié sur un topic
    pub fn last_json(&self, topic: &str) -> anyhow::Result<Option<Value>> {
        match self.published_to(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Nombre total d'appels à `subscribe` réussis
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Abonnements vivants couvrant ce topic
    pub fn subscribers_of(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| !s.tx.is_closed() && s.topics.iter().any(|t| t == topic))
            .count()
    }

    /// Attend qu'au moins `count` abonnements couvrent le topic
    pub async fn wait_for_subscribers(&self, topic: &str, count: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.subscribers_of(topic) >= count {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn deliver(&self, msg: &Message) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| s.topics.iter().any(|t| *t == msg.topic)) {
            // QoS 0 : un canal plein perd le message
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(topic = %msg.topic, error = %e, "[MOCK] delivery dropped"),
            }
        }
        delivered
    }

    fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MockBroker {
    async fn ping(&self) -> Result<(), TransportError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TransportError::Unreachable("mock broker is down".into()))
        }
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<Subscription, TransportError> {
        if !self.is_reachable() {
            return Err(TransportError::Unreachable("mock broker is down".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        debug!(?topics, "[MOCK] subscribed");
        self.inner.subscribers.lock().push(Subscriber { topics, tx });
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::new(rx, None))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_reachable() {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "mock broker is down".into(),
            });
        }
        if self.inner.failing.lock().contains(topic) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }

        let msg = Message::new(topic, payload);
        self.inner.published.lock().push(msg.clone());
        self.deliver(&msg);
        Ok(())
    }
}
