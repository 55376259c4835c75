use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use mavio::protocol::V2;
use mavio::Frame;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::MavMessage;

use crate::prelude::*;

/// Information about a communication link, used in log lines.
#[derive(Clone, Debug)]
pub enum ConnectionInfo {
    /// Bound UDP endpoint.
    UdpEndpoint {
        /// Address the socket is bound to.
        bind_addr: String,
    },
    /// Outgoing TCP stream.
    TcpClient {
        /// Address of the remote peer.
        remote_addr: String,
    },
    /// In-process link, mostly useful for tests and simulators.
    Loopback,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionInfo::UdpEndpoint { bind_addr } => write!(f, "udp:{bind_addr}"),
            ConnectionInfo::TcpClient { remote_addr } => write!(f, "tcp:{remote_addr}"),
            ConnectionInfo::Loopback => write!(f, "loopback"),
        }
    }
}

/// A decoded inbound message and the address it was received from.
#[derive(Clone, Debug)]
pub struct IncomingFrame {
    /// The decoded message.
    pub message: MavMessage,
    /// Address of the sending peer.
    pub address: SocketAddr,
}

/// Where an outgoing frame should go within one link.
#[derive(Clone, Copy, Debug)]
pub enum SendTarget {
    /// A single peer.
    Unicast(SocketAddr),
    /// Every peer reachable through the link.
    Broadcast,
}

/// A frame handed to a transport for transmission.
#[derive(Debug)]
pub struct OutgoingFrame {
    /// The frame to put on the wire.
    pub frame: Frame<V2>,
    /// Addressing within the link.
    pub target: SendTarget,
    /// Single-shot acknowledgement of the transmission attempt; `None` for
    /// fire-and-forget sends.
    pub done: Option<oneshot::Sender<Result<()>>>,
}

impl OutgoingFrame {
    /// Reports the outcome of the transmission attempt to the sender, if it
    /// asked for one.
    pub fn complete(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// A running transport.
///
/// Produced by a [`ConnectionBuilder`]; the embedded handler task owns the
/// underlying socket. When the handler finishes, both channels close and the
/// connection counts as lost.
#[derive(Debug)]
pub struct Connection {
    pub(crate) info: ConnectionInfo,
    pub(crate) sender: mpsc::Sender<OutgoingFrame>,
    pub(crate) receiver: mpsc::Receiver<IncomingFrame>,
    pub(crate) handler: JoinHandle<Result<()>>,
    pub(crate) token: CancellationToken,
}

impl Connection {
    /// Creates a connection from its parts.
    pub fn new(
        info: ConnectionInfo,
        sender: mpsc::Sender<OutgoingFrame>,
        receiver: mpsc::Receiver<IncomingFrame>,
        handler: JoinHandle<Result<()>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            info,
            sender,
            receiver,
            handler,
            token,
        }
    }

    /// Information about this connection.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

/// Configuration of a transport that can be (re)opened.
///
/// Builders stay alive for the whole life of a network so the supervisor can
/// reopen dropped connections; identity (registration order and link name) is
/// preserved across reopenings.
#[async_trait]
pub trait ConnectionBuilder: Send + Sync + fmt::Debug {
    /// Information about the configured connection.
    fn info(&self) -> ConnectionInfo;

    /// Opens the transport and spawns its I/O tasks.
    async fn build(&self, token: CancellationToken) -> Result<Connection>;

    /// `true` when this transport accepts incoming peers rather than dialing
    /// out.
    fn is_listener(&self) -> bool {
        false
    }

    /// `true` when a dropped connection may be reopened by the supervisor.
    fn is_repairable(&self) -> bool {
        false
    }

    /// `true` when the transport can deliver broadcast frames.
    fn supports_broadcast(&self) -> bool {
        false
    }
}
