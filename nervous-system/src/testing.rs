//! Broker d'enregistrement pour les tests unitaires du crate

use crate::broker::{Broker, Subscription};
use crate::error::TransportError;
use crate::models::Message;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RecordingBroker {
    published: Arc<Mutex<Vec<Message>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingBroker {
    pub fn fail_topic(&self, topic: &str) {
        self.failing.lock().insert(topic.to_string());
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

impl Broker for RecordingBroker {
    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<Subscription, TransportError> {
        Err(TransportError::SubscribeRejected {
            topics,
            reason: "recording broker has no subscriptions".into(),
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.lock().contains(topic) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.published.lock().push(Message::new(topic, payload));
        Ok(())
    }
}
