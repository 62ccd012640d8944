//! Heartbeat sender
//!
//! Sends a sign of life to the monitor at a fixed frequency, the first one
//! immediately on start.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::protocol::{Destination, Envelope, Heartbeat, Message};
use crate::transport::Transport;

pub struct HeartbeatSender {
    replica_id: String,
    interval: Duration,
    transport: Arc<dyn Transport>,
}

impl HeartbeatSender {
    pub fn new(replica_id: String, interval: Duration, transport: Arc<dyn Transport>) -> Self {
        Self {
            replica_id,
            interval,
            transport,
        }
    }

    /// Send one heartbeat
    pub async fn beat(&self) -> Result<()> {
        let envelope = Envelope::new(
            self.replica_id.clone(),
            Message::Heartbeat(Heartbeat {
                replica_id: self.replica_id.clone(),
                timestamp: chrono::Utc::now(),
            }),
        );
        self.transport.send(&Destination::Monitor, envelope).await
    }

    /// Beat until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        tracing::warn!("Heartbeat from {} not delivered: {}", self.replica_id, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Heartbeat sender for {} stopped", self.replica_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{inbox, LocalTransport};

    #[tokio::test]
    async fn test_first_beat_is_immediate() {
        let hub = Arc::new(LocalTransport::new());
        let (monitor, mut rx) = inbox("monitor");
        hub.subscribe(Destination::Monitor, monitor).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender = HeartbeatSender::new("ONE".into(), Duration::from_secs(3600), hub.clone());
        let task = tokio::spawn(sender.run(shutdown_rx));

        let envelope = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match envelope.body {
            Message::Heartbeat(hb) => assert_eq!(hb.replica_id, "ONE"),
            other => panic!("Wrong message type: {}", other.type_name()),
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
