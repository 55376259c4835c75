use std::net::SocketAddr;

use async_trait::async_trait;
use mavio::io::{TokioReader, TokioWriter};
use mavio::protocol::V2;
use mavio::{AsyncReceiver, AsyncSender};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consts::{CONN_INCOMING_CHAN_CAPACITY, CONN_OUTGOING_CHAN_CAPACITY};
use crate::io::{Connection, ConnectionBuilder, ConnectionInfo, IncomingFrame, OutgoingFrame};
use crate::protocol::MavMessage;

use crate::prelude::*;

/// Outgoing TCP stream, e.g. towards a SITL simulator.
///
/// The stream has exactly one peer, so unicast and broadcast frames both go
/// to it.
#[derive(Clone, Debug)]
pub struct TcpClientConnection {
    remote_addr: String,
}

impl TcpClientConnection {
    /// Creates a TCP client connection towards the given address.
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
        }
    }
}

#[async_trait]
impl ConnectionBuilder for TcpClientConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo::TcpClient {
            remote_addr: self.remote_addr.clone(),
        }
    }

    fn is_repairable(&self) -> bool {
        true
    }

    fn supports_broadcast(&self) -> bool {
        true
    }

    async fn build(&self, token: CancellationToken) -> Result<Connection> {
        let stream = TcpStream::connect(&self.remote_addr).await?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let info = self.info();
        let (incoming_tx, incoming_rx) = mpsc::channel(CONN_INCOMING_CHAN_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CONN_OUTGOING_CHAN_CAPACITY);

        let handler = {
            let info = info.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    result = read_loop(read_half, info.clone(), peer_addr, incoming_tx) => result,
                    result = write_loop(write_half, outgoing_rx) => result,
                }
            })
        };

        Ok(Connection::new(info, outgoing_tx, incoming_rx, handler, token))
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    info: ConnectionInfo,
    peer_addr: SocketAddr,
    incoming_tx: mpsc::Sender<IncomingFrame>,
) -> Result<()> {
    let mut receiver = AsyncReceiver::versionless(TokioReader::new(read_half));

    loop {
        let frame = match receiver.recv().await {
            Ok(frame) => frame,
            Err(mavio::error::Error::Io(err)) => {
                return Err(Error::Mavlink(mavio::error::Error::Io(err)));
            }
            Err(err) => {
                log::trace!("[{info}] skipping malformed frame: {err:?}");
                continue;
            }
        };

        match MavMessage::from_frame(&frame) {
            Ok(message) => {
                let incoming = IncomingFrame {
                    message,
                    address: peer_addr,
                };
                if incoming_tx.send(incoming).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                log::trace!("[{info}] dropping undecodable frame: {err:?}");
            }
        }
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<OutgoingFrame>,
) -> Result<()> {
    let mut sender = AsyncSender::versioned(TokioWriter::new(write_half), V2);

    while let Some(outgoing) = outgoing_rx.recv().await {
        match sender.send(&outgoing.frame).await {
            Ok(_) => outgoing.complete(Ok(())),
            Err(err) => {
                let err = Error::from(err);
                outgoing.complete(Err(err.clone()));
                return Err(err);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tcp_transport_tests {
    use super::*;

    use mavio::protocol::{Endpoint, MavLinkId};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::io::transport::udp::frames_from_datagram;
    use crate::io::SendTarget;
    use crate::protocol::dialect::messages::Heartbeat;
    use crate::protocol::dialect::Ardupilotmega;

    #[tokio::test]
    async fn frames_flow_in_both_directions() {
        let port = portpicker::pick_unused_port().unwrap();
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await.unwrap();

        let token = CancellationToken::new();
        let builder = TcpClientConnection::new(addr);
        let connect = builder.build(token.child_token());
        let (connection, accepted) = tokio::join!(connect, listener.accept());
        let mut connection = connection.unwrap();
        let (mut server_stream, _) = accepted.unwrap();

        // Server → client
        let endpoint = Endpoint::v2(MavLinkId::new(7, 1));
        let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
        let bytes = crate::io::transport::udp::frame_to_bytes(&frame).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut server_stream, &bytes)
            .await
            .unwrap();

        let incoming = connection.receiver.recv().await.unwrap();
        assert_eq!(incoming.message.system_id(), 7);

        // Client → server
        let frame = Endpoint::v2(MavLinkId::new(255, 190))
            .next_frame(&Heartbeat::default())
            .unwrap();
        connection
            .sender
            .send(OutgoingFrame {
                frame,
                target: SendTarget::Broadcast,
                done: None,
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let size = server_stream.read(&mut buf).await.unwrap();
        let frames = frames_from_datagram(&buf[..size]);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].decode::<Ardupilotmega>(),
            Ok(Ardupilotmega::Heartbeat(_))
        ));

        token.cancel();
    }
}
