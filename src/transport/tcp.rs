//! TCP transport
//!
//! Forwards envelopes to peer processes as CRC-checked bincode frames and
//! delivers inbound frames to an in-process [`LocalTransport`]. Each frame is
//! acknowledged with one byte telling the sender whether a local subscriber
//! took it, so queue messages can move on to the next peer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use super::{LocalTransport, Subscriber, Transport};
use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame, Destination, Envelope, WireFrame};

const ACK_DELIVERED: u8 = 1;
const ACK_NO_SUBSCRIBER: u8 = 0;

/// Where remote destinations live
#[derive(Debug, Clone, Default)]
pub struct TcpRoutes {
    /// Address of the monitor process
    pub monitor: Option<String>,
    /// Replica id to replica server address
    pub replicas: BTreeMap<String, String>,
    /// Address hosting named clients (the monitor process)
    pub clients: Option<String>,
}

impl TcpRoutes {
    /// Remote addresses that may consume a destination
    pub fn addresses(&self, destination: &Destination) -> Vec<String> {
        match destination {
            Destination::AllReplicas | Destination::AnyReplica => {
                self.replicas.values().cloned().collect()
            }
            Destination::Replica(id) => self.replicas.get(id).cloned().into_iter().collect(),
            Destination::Monitor => self.monitor.clone().into_iter().collect(),
            Destination::Client(_) => self.clients.clone().into_iter().collect(),
        }
    }
}

/// Transport spanning processes over TCP
pub struct TcpTransport {
    /// Bind address for inbound frames
    bind_address: String,
    /// Local delivery
    local: Arc<LocalTransport>,
    /// Remote destinations
    routes: TcpRoutes,
    /// Connection timeout
    connect_timeout: Duration,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(bind_address: String, routes: TcpRoutes, connect_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            local: Arc::new(LocalTransport::new()),
            routes,
            connect_timeout,
            shutdown: shutdown_tx,
        }
    }

    /// The in-process side of this transport
    pub fn local(&self) -> &Arc<LocalTransport> {
        &self.local
    }

    /// Accept inbound frames until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Transport listening on {}", self.bind_address);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let local = Arc::clone(&self.local);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, local).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Transport stopped");
        Ok(())
    }

    /// Stop accepting frames
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Forward one frame; true when a remote subscriber took it
    async fn forward(&self, address: &str, frame: &WireFrame) -> Result<bool> {
        let mut stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, frame).await?;
        let ack = reader.read_u8().await?;
        writer.shutdown().await?;
        Ok(ack == ACK_DELIVERED)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::Transport(format!(
                "Failed to connect to {}: {}",
                address, e
            ))),
            Err(_) => Err(Error::Transport(format!("Connection timeout: {}", address))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        let mut addresses = self.routes.addresses(destination);

        if destination.is_topic() {
            let mut delivered = self.local.deliver(destination, envelope.clone()).await?;
            let frame = WireFrame {
                destination: destination.clone(),
                envelope,
            };
            let mut last_error = None;
            for address in &addresses {
                match self.forward(address, &frame).await {
                    Ok(true) => delivered += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Failed to forward to {}: {}", address, e);
                        last_error = Some(e);
                    }
                }
            }
            return match (delivered, last_error) {
                (0, Some(e)) => Err(e),
                _ => Ok(()),
            };
        }

        if self.local.subscriber_count(destination).await > 0 {
            return self.local.deliver(destination, envelope).await.map(|_| ());
        }

        if addresses.is_empty() {
            return Err(Error::Transport(format!("No route to destination {}", destination)));
        }

        addresses.shuffle(&mut rand::thread_rng());
        let frame = WireFrame {
            destination: destination.clone(),
            envelope,
        };
        for address in &addresses {
            match self.forward(address, &frame).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::debug!("{} has no consumer for {}, trying next", address, destination);
                }
                Err(e) => {
                    tracing::warn!("Failed to forward to {}: {}", address, e);
                }
            }
        }

        Err(Error::Transport(format!(
            "No reachable consumer for destination {}",
            destination
        )))
    }

    async fn subscribe(&self, destination: Destination, subscriber: Subscriber) -> Result<()> {
        self.local.subscribe(destination, subscriber).await
    }

    async fn unsubscribe(&self, destination: &Destination, name: &str) -> Result<()> {
        self.local.unsubscribe(destination, name).await
    }
}

/// Handle a single inbound connection
async fn handle_connection(socket: TcpStream, peer_addr: &str, local: Arc<LocalTransport>) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                tracing::trace!(
                    "Received {} for {} from {}",
                    frame.envelope.body.type_name(),
                    frame.destination,
                    peer_addr
                );

                let ack = match local.deliver(&frame.destination, frame.envelope).await {
                    Ok(n) if n > 0 => ACK_DELIVERED,
                    Ok(_) => ACK_NO_SUBSCRIBER,
                    Err(e) => {
                        tracing::debug!("Inbound frame for {} not delivered: {}", frame.destination, e);
                        ACK_NO_SUBSCRIBER
                    }
                };
                writer.write_u8(ack).await?;
                writer.flush().await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading frame: {}", e);
                break;
            }
        }
    }

    Ok(())
}
