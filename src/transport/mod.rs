//! Transport Module
//!
//! Asynchronous message channels with named destinations. Topics deliver a
//! copy to every subscriber, every other destination behaves as a queue
//! with a single consumer per message.

mod local;
mod tcp;

pub use local::LocalTransport;
pub use tcp::{TcpRoutes, TcpTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{Destination, Envelope, Header, Message};

/// Default capacity of a subscriber inbox
pub const INBOX_CAPACITY: usize = 1024;

/// Receiving end of a subscription
pub type Inbox = mpsc::Receiver<Envelope>;

/// Sending end of a subscription, registered with a transport
#[derive(Debug, Clone)]
pub struct Subscriber {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

impl Subscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver an envelope; false when the inbox is gone
    pub async fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a named inbox and its subscriber handle
pub fn inbox(name: impl Into<String>) -> (Subscriber, Inbox) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    (Subscriber { name: name.into(), tx }, rx)
}

/// Message transport between archive components
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope to a destination
    async fn send(&self, destination: &Destination, envelope: Envelope) -> Result<()>;

    /// Start receiving messages sent to `destination`
    async fn subscribe(&self, destination: Destination, subscriber: Subscriber) -> Result<()>;

    /// Stop receiving messages sent to `destination`
    async fn unsubscribe(&self, destination: &Destination, name: &str) -> Result<()>;

    /// Reply to a request at its reply destination
    async fn reply(&self, sender: &str, request: &Header, body: Message) -> Result<()> {
        let destination = request.reply_to.as_ref().ok_or_else(|| {
            Error::Transport(format!(
                "Cannot reply to message {}: no reply destination",
                request.id
            ))
        })?;
        self.send(destination, Envelope::reply(sender, request, body)).await
    }
}
