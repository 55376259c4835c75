use std::collections::HashSet;
use std::io::Cursor;
use std::net::SocketAddr;

use async_trait::async_trait;
use mavio::io::{StdIoReader, StdIoWriter};
use mavio::protocol::{Versionless, V2};
use mavio::{Frame, Receiver, Sender};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consts::{CONN_INCOMING_CHAN_CAPACITY, CONN_OUTGOING_CHAN_CAPACITY};
use crate::io::{
    Connection, ConnectionBuilder, ConnectionInfo, IncomingFrame, OutgoingFrame, SendTarget,
};
use crate::protocol::MavMessage;

use crate::prelude::*;

/// Bound UDP endpoint shared by every drone on the link.
///
/// Peers are discovered from inbound traffic; broadcasts go to the
/// configured broadcast address when one is set, or to every peer seen so
/// far otherwise.
#[derive(Clone, Debug)]
pub struct UdpConnection {
    bind_addr: String,
    broadcast_addr: Option<String>,
}

impl UdpConnection {
    /// Creates a UDP endpoint bound to the given address.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broadcast_addr: None,
        }
    }

    /// Sets an explicit broadcast address for this endpoint.
    pub fn with_broadcast(mut self, broadcast_addr: impl Into<String>) -> Self {
        self.broadcast_addr = Some(broadcast_addr.into());
        self
    }
}

#[async_trait]
impl ConnectionBuilder for UdpConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo::UdpEndpoint {
            bind_addr: self.bind_addr.clone(),
        }
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn is_repairable(&self) -> bool {
        true
    }

    fn supports_broadcast(&self) -> bool {
        true
    }

    async fn build(&self, token: CancellationToken) -> Result<Connection> {
        let socket = UdpSocket::bind(&self.bind_addr).await?;

        let broadcast_addr = match &self.broadcast_addr {
            Some(addr) => {
                socket.set_broadcast(true)?;
                let resolved = tokio::net::lookup_host(addr)
                    .await?
                    .next()
                    .ok_or_else(|| Error::Config(format!("can't resolve address: {addr}")))?;
                Some(resolved)
            }
            None => None,
        };

        let info = self.info();
        let (incoming_tx, incoming_rx) = mpsc::channel(CONN_INCOMING_CHAN_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CONN_OUTGOING_CHAN_CAPACITY);

        let handler = {
            let info = info.clone();
            let token = token.clone();
            tokio::spawn(async move {
                udp_io(socket, info, incoming_tx, outgoing_rx, broadcast_addr, token).await
            })
        };

        Ok(Connection::new(info, outgoing_tx, incoming_rx, handler, token))
    }
}

async fn udp_io(
    socket: UdpSocket,
    info: ConnectionInfo,
    incoming_tx: mpsc::Sender<IncomingFrame>,
    mut outgoing_rx: mpsc::Receiver<OutgoingFrame>,
    broadcast_addr: Option<SocketAddr>,
    token: CancellationToken,
) -> Result<()> {
    let mut peers: HashSet<SocketAddr> = HashSet::new();
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),

            received = socket.recv_from(&mut buf) => {
                let (size, peer_addr) = received?;
                peers.insert(peer_addr);

                for frame in frames_from_datagram(&buf[..size]) {
                    match MavMessage::from_frame(&frame) {
                        Ok(message) => {
                            let incoming = IncomingFrame { message, address: peer_addr };
                            if incoming_tx.send(incoming).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            log::trace!("[{info}] dropping undecodable frame from {peer_addr}: {err:?}");
                        }
                    }
                }
            }

            outgoing = outgoing_rx.recv() => {
                let Some(outgoing) = outgoing else { return Ok(()) };
                let result = transmit(&socket, &outgoing, broadcast_addr, &peers).await;
                outgoing.complete(result);
            }
        }
    }
}

async fn transmit(
    socket: &UdpSocket,
    outgoing: &OutgoingFrame,
    broadcast_addr: Option<SocketAddr>,
    peers: &HashSet<SocketAddr>,
) -> Result<()> {
    let bytes = frame_to_bytes(&outgoing.frame)?;
    match outgoing.target {
        SendTarget::Unicast(address) => {
            socket.send_to(&bytes, address).await?;
        }
        SendTarget::Broadcast => {
            if let Some(address) = broadcast_addr {
                socket.send_to(&bytes, address).await?;
            } else {
                for peer in peers {
                    socket.send_to(&bytes, *peer).await?;
                }
            }
        }
    }
    Ok(())
}

/// Serializes a frame into the byte form a datagram carries.
pub(crate) fn frame_to_bytes(frame: &Frame<V2>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(frame.body_length() + 16);
    {
        let mut sender = Sender::versioned(StdIoWriter::new(&mut buf), V2);
        sender.send(frame)?;
    }
    Ok(buf)
}

/// Extracts every well-formed frame from a received datagram.
///
/// Parsing stops at the first malformed frame; the remaining bytes are
/// dropped.
pub(crate) fn frames_from_datagram(datagram: &[u8]) -> Vec<Frame<Versionless>> {
    let mut receiver = Receiver::versionless(StdIoReader::new(Cursor::new(datagram)));
    let mut frames = Vec::new();
    while let Ok(frame) = receiver.recv() {
        frames.push(frame);
    }
    frames
}
