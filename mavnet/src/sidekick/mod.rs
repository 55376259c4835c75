//! # Sidekick fan-out service
//!
//! Sidekick is a helper process that manages a secondary radio channel
//! independently of the server. This service lets Sidekick instances connect
//! over TCP and receive pre-encoded RTK correction fragments as
//! line-delimited JSON. The data is strictly optional for Sidekick, so the
//! forwarding path never blocks: a subscriber that cannot keep up simply
//! loses packets.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::consts::{
    DEFAULT_SIDEKICK_PORT, SIDEKICK_CHANNEL_CAPACITY, SIDEKICK_KEEPALIVE_INTERVAL,
    SIDEKICK_SERVICE_NAME,
};
use crate::protocol::dialect::messages::GpsRtcmData;
use crate::signals::{RtkFragmentsEvent, Signal, SignalSubscription};
use crate::utils::net::service_location;

use crate::prelude::*;

/// Location callback handed to an SSDP implementation; receives the address
/// of the querying client, when known.
pub type LocationProvider = Arc<dyn Fn(Option<IpAddr>) -> Option<String> + Send + Sync>;

/// Hook point towards an SSDP implementation.
///
/// The discovery protocol itself is outside this crate; implementations only
/// need to publish and withdraw a named service whose location is resolved
/// through the given provider.
pub trait SsdpService: Send + Sync {
    /// Starts advertising a service.
    fn advertise(&self, service: &str, location: LocationProvider);

    /// Stops advertising a service.
    fn withdraw(&self, service: &str);
}

/// Configuration of the Sidekick listener.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SidekickConfig {
    /// Host to listen on; empty means all interfaces.
    #[serde(default)]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_SIDEKICK_PORT
}

impl Default for SidekickConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SIDEKICK_PORT,
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

/// TCP fan-out service for Sidekick consumers.
pub struct SidekickServer {
    bind_addr: String,
    address: Mutex<Option<SocketAddr>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
}

impl SidekickServer {
    /// Creates the service from its configuration.
    pub fn new(config: &SidekickConfig) -> Self {
        let host = if config.host.is_empty() {
            "0.0.0.0"
        } else {
            config.host.as_str()
        };
        Self {
            bind_addr: format!("{host}:{}", config.port),
            address: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Subscribes this service to a network's RTK fragment signal.
    ///
    /// The handler enqueues every fragment batch to all connected Sidekick
    /// clients without blocking the emitting network.
    #[must_use]
    pub fn rtk_subscription(
        &self,
        signal: &Signal<RtkFragmentsEvent>,
    ) -> SignalSubscription<RtkFragmentsEvent> {
        let subscribers = self.subscribers.clone();
        signal.subscribe(move |event| forward_rtk_fragments(&subscribers, event))
    }

    /// SSDP location of the listener, resolved for the given client.
    pub fn location(&self, client: Option<IpAddr>) -> Option<String> {
        let address = (*self.address.lock().expect("poisoned address slot"))?;
        service_location(address, client)
    }

    /// Accepts and serves Sidekick clients until the token is cancelled.
    ///
    /// A fault on one client connection never tears down the acceptor.
    pub async fn serve(
        self: &Arc<Self>,
        ssdp: Option<Arc<dyn SsdpService>>,
        token: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.address.lock().expect("poisoned address slot") = Some(local_addr);

        if let Some(ssdp) = &ssdp {
            let this = self.clone();
            ssdp.advertise(
                SIDEKICK_SERVICE_NAME,
                Arc::new(move |client| this.location(client)),
            );
        }

        log::info!("Listening for Sidekick connections on {local_addr}");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        log::info!("Sidekick connection accepted from {peer_addr}");
                        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
                        let subscribers = self.subscribers.clone();
                        let client_token = token.child_token();
                        tokio::spawn(async move {
                            handle_client(stream, peer_addr, id, subscribers, client_token).await;
                        });
                    }
                    Err(err) => {
                        log::warn!("can't accept Sidekick connection: {err}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        if let Some(ssdp) = &ssdp {
            ssdp.withdraw(SIDEKICK_SERVICE_NAME);
        }
        self.subscribers.lock().expect("poisoned subscriber list").clear();
        *self.address.lock().expect("poisoned address slot") = None;
        log::info!("Sidekick socket closed on {local_addr}");

        Ok(())
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("poisoned subscriber list").len()
    }
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: u64,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    token: CancellationToken,
) {
    use tokio::io::AsyncReadExt;

    let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(SIDEKICK_CHANNEL_CAPACITY);
    subscribers
        .lock()
        .expect("poisoned subscriber list")
        .push(Subscriber { id, sender });

    let (mut read_half, mut write_half) = stream.into_split();
    let mut drain = [0u8; 64];

    let mut keepalive = tokio::time::interval(SIDEKICK_KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; consume it so keepalives start one
    // interval after the connection was accepted.
    keepalive.tick().await;

    let result: Result<()> = async {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),

                payload = receiver.recv() => match payload {
                    Some(payload) => write_half.write_all(&payload).await?,
                    None => return Ok(()),
                },

                // Sidekick clients never talk back; a read is either their
                // disconnect or ignorable chatter.
                read = read_half.read(&mut drain) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(err.into()),
                },

                _ = keepalive.tick() => write_half.write_all(b"\n").await?,
            }
        }
    }
    .await;

    subscribers
        .lock()
        .expect("poisoned subscriber list")
        .retain(|subscriber| subscriber.id != id);

    match result {
        Ok(()) => log::info!("Sidekick connection from {peer_addr} closed"),
        Err(Error::Io(err)) if is_disconnect(&err) => {
            log::info!("Sidekick connection from {peer_addr} closed")
        }
        Err(err) => log::error!("Error on Sidekick connection from {peer_addr}: {err}"),
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Enqueues one fragment batch to every subscriber, dropping on a full
/// queue.
fn forward_rtk_fragments(subscribers: &Mutex<Vec<Subscriber>>, event: &RtkFragmentsEvent) {
    if subscribers.lock().expect("poisoned subscriber list").is_empty() {
        return;
    }

    let line = match encode_rtk_line(&event.messages) {
        Ok(line) => line,
        Err(err) => {
            log::error!("can't encode RTK fragments for Sidekick: {err}");
            return;
        }
    };

    let mut dropped = 0usize;
    for subscriber in subscribers.lock().expect("poisoned subscriber list").iter() {
        match subscriber.sender.try_send(line.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => dropped += 1,
            // The writer task removes closed subscribers on its own.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    if dropped > 0 {
        log::warn!("Dropping outbound RTK correction packet due to backpressure");
    }
}

#[derive(Serialize)]
struct RtkFields {
    len: u8,
    flags: u8,
    data: String,
}

#[derive(Serialize)]
struct SidekickCommand<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: T,
}

/// Serializes a fragment batch into one newline-terminated JSON line.
fn encode_rtk_line(messages: &[GpsRtcmData]) -> Result<Vec<u8>> {
    let data: Vec<(&'static str, RtkFields)> = messages
        .iter()
        .map(|message| {
            (
                "GPS_RTCM_DATA",
                RtkFields {
                    len: message.len,
                    flags: message.flags,
                    data: BASE64.encode(&message.data[..message.len as usize]),
                },
            )
        })
        .collect();

    let mut line = serde_json::to_vec(&SidekickCommand { kind: "rtk", data })
        .map_err(|err| Error::Other(format!("JSON encoding failed: {err}")))?;
    line.push(b'\n');
    Ok(line)
}

///////////////////////////////////////////////////////////////////////////////
//                                  Tests                                    //
///////////////////////////////////////////////////////////////////////////////
