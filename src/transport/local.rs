//! In-process transport hub over tokio channels

use std::collections::HashMap;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use super::{Subscriber, Transport};
use crate::error::{Error, Result};
use crate::protocol::{Destination, Envelope};

/// In-process message hub
#[derive(Default)]
pub struct LocalTransport {
    subscriptions: RwLock<HashMap<Destination, Vec<Subscriber>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers of a destination
    pub async fn subscriber_count(&self, destination: &Destination) -> usize {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(destination)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether a named subscriber listens on a destination
    pub async fn is_subscribed(&self, destination: &Destination, name: &str) -> bool {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(destination)
            .map(|subs| subs.iter().any(|s| s.name() == name && !s.is_closed()))
            .unwrap_or(false)
    }

    /// Deliver to local subscribers only.
    ///
    /// Topics reach every subscriber; other destinations reach one randomly
    /// chosen subscriber. Returns the number of deliveries.
    pub async fn deliver(&self, destination: &Destination, envelope: Envelope) -> Result<usize> {
        let subscribers: Vec<Subscriber> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .get(destination)
                .map(|subs| subs.iter().filter(|s| !s.is_closed()).cloned().collect())
                .unwrap_or_default()
        };

        if subscribers.is_empty() {
            if destination.is_topic() {
                tracing::debug!(
                    "No subscribers for {} on {}, dropping",
                    envelope.body.type_name(),
                    destination
                );
                return Ok(0);
            }
            return Err(Error::Transport(format!("No subscriber for destination {}", destination)));
        }

        if destination.is_topic() {
            let mut delivered = 0;
            for subscriber in &subscribers {
                if subscriber.deliver(envelope.clone()).await {
                    delivered += 1;
                }
            }
            self.prune_closed(destination).await;
            return Ok(delivered);
        }

        let index = rand::thread_rng().gen_range(0..subscribers.len());
        if subscribers[index].deliver(envelope).await {
            Ok(1)
        } else {
            self.prune_closed(destination).await;
            Err(Error::Transport(format!(
                "Subscriber '{}' of {} is gone",
                subscribers[index].name(),
                destination
            )))
        }
    }

    async fn prune_closed(&self, destination: &Destination) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subs) = subscriptions.get_mut(destination) {
            subs.retain(|s| !s.is_closed());
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        tracing::trace!(
            "Sending {} {} from {} to {}",
            envelope.body.type_name(),
            envelope.header.id,
            envelope.header.sender,
            destination
        );
        self.deliver(destination, envelope).await.map(|_| ())
    }

    async fn subscribe(&self, destination: Destination, subscriber: Subscriber) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subs = subscriptions.entry(destination.clone()).or_default();
        subs.retain(|s| s.name() != subscriber.name() && !s.is_closed());
        tracing::debug!("'{}' subscribed to {}", subscriber.name(), destination);
        subs.push(subscriber);
        Ok(())
    }

    async fn unsubscribe(&self, destination: &Destination, name: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subs) = subscriptions.get_mut(destination) {
            subs.retain(|s| s.name() != name);
            tracing::debug!("'{}' unsubscribed from {}", name, destination);
        }
        Ok(())
    }
}
