use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use mavio::protocol::V2;
use mavio::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consts::{CONN_INCOMING_CHAN_CAPACITY, CONN_OUTGOING_CHAN_CAPACITY};
use crate::io::{
    Connection, ConnectionBuilder, ConnectionInfo, IncomingFrame, OutgoingFrame, SendTarget,
};
use crate::protocol::dialect::Ardupilotmega;
use crate::protocol::{ComponentId, MavMessage, SystemId};

use crate::prelude::*;

struct LoopbackParts {
    incoming_rx: mpsc::Receiver<IncomingFrame>,
    sent_tx: mpsc::UnboundedSender<(Frame<V2>, Option<SocketAddr>)>,
}

/// In-process link.
///
/// The paired [`LoopbackPeer`] plays the role of the rest of the network:
/// whatever it injects shows up as inbound traffic, and every frame the
/// network sends is observable on the peer side. Useful for tests and
/// simulated vehicles.
#[derive(Debug)]
pub struct LoopbackConnection {
    parts: Mutex<Option<LoopbackParts>>,
    fail_sends: bool,
}

impl std::fmt::Debug for LoopbackParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackParts").finish_non_exhaustive()
    }
}

impl LoopbackConnection {
    /// Creates a loopback link and the peer endpoint attached to it.
    pub fn channel() -> (Self, LoopbackPeer) {
        Self::with_failure_mode(false)
    }

    /// Creates a loopback link on which every send attempt fails.
    ///
    /// Useful for exercising failover paths.
    pub fn failing() -> (Self, LoopbackPeer) {
        Self::with_failure_mode(true)
    }

    fn with_failure_mode(fail_sends: bool) -> (Self, LoopbackPeer) {
        let (incoming_tx, incoming_rx) = mpsc::channel(CONN_INCOMING_CHAN_CAPACITY);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();

        let connection = Self {
            parts: Mutex::new(Some(LoopbackParts {
                incoming_rx,
                sent_tx,
            })),
            fail_sends,
        };
        let peer = LoopbackPeer {
            incoming_tx,
            sent_rx,
        };
        (connection, peer)
    }
}

#[async_trait]
impl ConnectionBuilder for LoopbackConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo::Loopback
    }

    fn supports_broadcast(&self) -> bool {
        true
    }

    async fn build(&self, token: CancellationToken) -> Result<Connection> {
        let parts = self
            .parts
            .lock()
            .expect("poisoned loopback mutex")
            .take()
            .ok_or_else(|| Error::Other("loopback connection can be built only once".into()))?;

        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel::<OutgoingFrame>(CONN_OUTGOING_CHAN_CAPACITY);
        let fail_sends = self.fail_sends;
        let sent_tx = parts.sent_tx;

        let handler = {
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        outgoing = outgoing_rx.recv() => {
                            let Some(outgoing) = outgoing else { return Ok(()) };
                            if fail_sends {
                                outgoing.complete(Err(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "loopback send failure",
                                )
                                .into()));
                                continue;
                            }
                            let address = match outgoing.target {
                                SendTarget::Unicast(address) => Some(address),
                                SendTarget::Broadcast => None,
                            };
                            let frame = outgoing.frame.clone();
                            if sent_tx.send((frame, address)).is_err() {
                                outgoing.complete(Err(Error::ChannelClosed(
                                    "loopback peer is gone".into(),
                                )));
                                return Ok(());
                            }
                            outgoing.complete(Ok(()));
                        }
                    }
                }
            })
        };

        Ok(Connection::new(
            ConnectionInfo::Loopback,
            outgoing_tx,
            parts.incoming_rx,
            handler,
            token,
        ))
    }
}

/// The far side of a [`LoopbackConnection`].
pub struct LoopbackPeer {
    incoming_tx: mpsc::Sender<IncomingFrame>,
    sent_rx: mpsc::UnboundedReceiver<(Frame<V2>, Option<SocketAddr>)>,
}

impl LoopbackPeer {
    /// Injects a message as if it arrived from `address`.
    pub async fn inject(
        &self,
        system_id: SystemId,
        component_id: ComponentId,
        message: Ardupilotmega,
        address: SocketAddr,
    ) {
        let incoming = IncomingFrame {
            message: MavMessage::new(system_id, component_id, message),
            address,
        };
        let _ = self.incoming_tx.send(incoming).await;
    }

    /// Waits for the next frame the network side has sent.
    ///
    /// The second element is the unicast destination, or `None` for a
    /// broadcast frame.
    pub async fn next_sent(&mut self) -> Option<(Frame<V2>, Option<SocketAddr>)> {
        self.sent_rx.recv().await
    }

    /// Returns the next already-sent frame without waiting.
    pub fn try_next_sent(&mut self) -> Option<(Frame<V2>, Option<SocketAddr>)> {
        self.sent_rx.try_recv().ok()
    }
}
