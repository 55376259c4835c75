//! # Communication manager
//!
//! Runs the transport set of one network: builds every registered
//! connection, merges their inbound traffic onto a single channel, accepts
//! outbound send requests with failover across same-named links, and reopens
//! dropped connections according to a [`RetryStrategy`].
//!
//! The manager itself is consumed by [`CommunicationManager::run`]; all
//! interaction while it is running goes through the clonable [`CommHandle`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mavio::protocol::{Endpoint, MavLinkId, SystemId, V2};
use mavio::Frame;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consts::{CONN_INCOMING_CHAN_CAPACITY, DEFAULT_LINK_NAME, GCS_COMPONENT_ID};
use crate::io::{Connection, ConnectionBuilder, OutgoingFrame, SendTarget};
use crate::protocol::{MavMessage, MessageSpec};

use crate::prelude::*;

/// How the manager treats a dropped connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Give up on the first failure.
    #[default]
    Never,
    /// Reopen a bounded number of consecutive times, waiting between
    /// attempts. The counter resets once a connection comes up.
    Attempts(usize, Duration),
    /// Keep reopening forever.
    Always(Duration),
}

/// A background task run next to the connections; aborted when the manager
/// stops.
pub type ManagerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An inbound message tagged with the link it arrived on.
#[derive(Clone, Debug)]
pub struct IncomingEnvelope {
    /// Symbolic name of the link.
    pub channel: Arc<str>,
    /// The decoded message.
    pub message: MavMessage,
    /// Address of the sending peer.
    pub address: SocketAddr,
}

/// Where a packet should be sent: a link name and a peer address within its
/// addressing domain.
#[derive(Clone, Debug)]
pub struct Destination {
    /// Symbolic name of the link set to use.
    pub link: String,
    /// Address of the target peer.
    pub address: SocketAddr,
}

impl Destination {
    /// Creates a destination on a named link.
    pub fn new(link: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            link: link.into(),
            address,
        }
    }

    /// Creates a destination on the default link.
    pub fn on_default_link(address: SocketAddr) -> Self {
        Self::new(DEFAULT_LINK_NAME, address)
    }
}

struct LinkConf {
    name: Arc<str>,
    builder: Arc<dyn ConnectionBuilder>,
}

#[derive(Clone)]
struct LinkSlot {
    name: Arc<str>,
    broadcast: bool,
    sender: Option<mpsc::Sender<OutgoingFrame>>,
}

#[derive(Default)]
struct LinkTable {
    slots: RwLock<Vec<LinkSlot>>,
}

impl LinkTable {
    fn push(&self, name: Arc<str>, broadcast: bool) {
        self.slots.write().expect("poisoned link table").push(LinkSlot {
            name,
            broadcast,
            sender: None,
        });
    }

    fn set_sender(&self, index: usize, sender: Option<mpsc::Sender<OutgoingFrame>>) {
        let mut slots = self.slots.write().expect("poisoned link table");
        if let Some(slot) = slots.get_mut(index) {
            slot.sender = sender;
        }
    }

    /// Senders of every live link with the given name, in registration
    /// order.
    fn senders_for(&self, link: &str) -> Vec<mpsc::Sender<OutgoingFrame>> {
        self.slots
            .read()
            .expect("poisoned link table")
            .iter()
            .filter(|slot| &*slot.name == link)
            .filter_map(|slot| slot.sender.clone())
            .collect()
    }

    /// Senders of every live broadcast-capable link, in registration order.
    fn broadcast_senders(&self) -> Vec<mpsc::Sender<OutgoingFrame>> {
        self.slots
            .read()
            .expect("poisoned link table")
            .iter()
            .filter(|slot| slot.broadcast)
            .filter_map(|slot| slot.sender.clone())
            .collect()
    }

    fn active_count(&self) -> usize {
        self.slots
            .read()
            .expect("poisoned link table")
            .iter()
            .filter(|slot| slot.sender.is_some())
            .count()
    }
}

/// Runs the transport set of one network.
pub struct CommunicationManager {
    links: Vec<LinkConf>,
    table: Arc<LinkTable>,
    endpoint: Endpoint<V2>,
    packet_loss: f64,
    retry: RetryStrategy,
}

impl CommunicationManager {
    /// Creates a manager that identifies itself with the given MAVLink
    /// system `ID`.
    pub fn new(system_id: SystemId, packet_loss: f64, retry: RetryStrategy) -> Self {
        Self {
            links: Vec::new(),
            table: Arc::new(LinkTable::default()),
            endpoint: Endpoint::v2(MavLinkId::new(system_id, GCS_COMPONENT_ID)),
            packet_loss: packet_loss.max(0.0),
            retry,
        }
    }

    /// Registers a transport under a symbolic link name.
    ///
    /// Registration order is significant: sends prefer earlier links and
    /// fall back to later ones sharing the same name.
    pub fn add(&mut self, builder: Arc<dyn ConnectionBuilder>, name: &str) {
        let name: Arc<str> = Arc::from(name);
        self.table.push(name.clone(), builder.supports_broadcast());
        self.links.push(LinkConf { name, builder });
    }

    /// Returns a handle for sending packets through this manager.
    pub fn handle(&self) -> CommHandle {
        CommHandle {
            table: self.table.clone(),
            endpoint: self.endpoint.clone(),
            packet_loss: self.packet_loss,
        }
    }

    /// Runs every registered connection, delivering merged inbound traffic
    /// to `consumer` and `tasks` as background children.
    ///
    /// Returns when `token` is cancelled or the consumer finishes on its
    /// own; either way all children are stopped before returning.
    pub async fn run<C, F>(
        self,
        consumer: C,
        tasks: Vec<ManagerTask>,
        token: CancellationToken,
    ) -> Result<()>
    where
        C: FnOnce(mpsc::Receiver<IncomingEnvelope>) -> F,
        F: Future<Output = Result<()>> + Send,
    {
        let local = token.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(CONN_INCOMING_CHAN_CAPACITY);

        let mut runners = Vec::new();
        for (index, link) in self.links.into_iter().enumerate() {
            runners.push(tokio::spawn(run_link(
                index,
                link,
                self.table.clone(),
                inbound_tx.clone(),
                self.packet_loss,
                self.retry,
                local.clone(),
            )));
        }

        let background: Vec<JoinHandle<()>> = tasks.into_iter().map(tokio::spawn).collect();

        let result = tokio::select! {
            _ = token.cancelled() => Ok(()),
            result = consumer(inbound_rx) => result,
        };

        local.cancel();
        for task in background {
            task.abort();
        }
        for runner in runners {
            let _ = runner.await;
        }
        drop(inbound_tx);

        result
    }
}

/// Clonable sending facade of a running [`CommunicationManager`].
#[derive(Clone)]
pub struct CommHandle {
    table: Arc<LinkTable>,
    endpoint: Endpoint<V2>,
    packet_loss: f64,
}

impl CommHandle {
    /// Sends one message to a specific destination.
    ///
    /// Links sharing the destination's name are tried in registration
    /// order; the call returns once one of them has put the frame on the
    /// wire. When every candidate fails, the error is
    /// [`NetworkError::SendFailed`].
    pub async fn send_packet(&self, spec: &MessageSpec, destination: &Destination) -> Result<()> {
        let frame = self.next_frame(spec)?;
        let senders = self.table.senders_for(&destination.link);

        let mut last_error: Option<Error> = None;
        for sender in senders {
            if self.simulate_loss() {
                return Ok(());
            }

            let (done_tx, done_rx) = oneshot::channel();
            let outgoing = OutgoingFrame {
                frame: frame.clone(),
                target: SendTarget::Unicast(destination.address),
                done: Some(done_tx),
            };

            if sender.send(outgoing).await.is_err() {
                last_error = Some(Error::ChannelClosed("connection is down".into()));
                continue;
            }
            match done_rx.await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => {
                    last_error = Some(Error::ChannelClosed("connection dropped while sending".into()))
                }
            }
        }

        if let Some(err) = last_error {
            log::debug!("all send attempts to {destination:?} failed, last error: {err}");
        }
        Err(NetworkError::SendFailed.into())
    }

    /// Emits one message on every broadcast-capable link.
    ///
    /// With `allow_failure` per-link errors are logged and swallowed;
    /// otherwise the first error is reported after all links were attempted.
    pub async fn broadcast_packet(&self, spec: &MessageSpec, allow_failure: bool) -> Result<()> {
        let frame = self.next_frame(spec)?;
        let mut first_error: Option<Error> = None;

        for sender in self.table.broadcast_senders() {
            if self.simulate_loss() {
                continue;
            }

            let (done_tx, done_rx) = oneshot::channel();
            let outgoing = OutgoingFrame {
                frame: frame.clone(),
                target: SendTarget::Broadcast,
                done: Some(done_tx),
            };

            let attempt = match sender.send(outgoing).await {
                Ok(()) => match done_rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ChannelClosed("connection dropped while sending".into())),
                },
                Err(_) => Err(Error::ChannelClosed("connection is down".into())),
            };

            if let Err(err) = attempt {
                if allow_failure {
                    log::warn!("broadcast failed on one connection: {err}");
                } else if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queues one message for broadcast without waiting for transmission.
    ///
    /// Fire-and-forget: a full or closed link queue drops the frame.
    pub fn enqueue_broadcast_packet(&self, spec: &MessageSpec) -> Result<()> {
        let frame = self.next_frame(spec)?;

        for sender in self.table.broadcast_senders() {
            if self.simulate_loss() {
                continue;
            }

            let outgoing = OutgoingFrame {
                frame: frame.clone(),
                target: SendTarget::Broadcast,
                done: None,
            };
            if sender.try_send(outgoing).is_err() {
                log::debug!("dropping queued broadcast packet: link queue unavailable");
            }
        }

        Ok(())
    }

    /// Number of links that are currently up.
    pub fn active_links(&self) -> usize {
        self.table.active_count()
    }

    fn next_frame(&self, spec: &MessageSpec) -> Result<Frame<V2>> {
        self.endpoint.next_frame(spec.message()).map_err(Error::from)
    }

    fn simulate_loss(&self) -> bool {
        simulate_loss(self.packet_loss)
    }
}

fn simulate_loss(packet_loss: f64) -> bool {
    packet_loss > 0.0 && rand::thread_rng().gen_bool(packet_loss.min(1.0))
}

async fn run_link(
    index: usize,
    link: LinkConf,
    table: Arc<LinkTable>,
    inbound_tx: mpsc::Sender<IncomingEnvelope>,
    packet_loss: f64,
    retry: RetryStrategy,
    token: CancellationToken,
) {
    let info = link.builder.info();
    let mut attempts_left = match retry {
        RetryStrategy::Attempts(attempts, _) => attempts,
        _ => 0,
    };

    loop {
        if token.is_cancelled() {
            break;
        }

        let built = tokio::select! {
            _ = token.cancelled() => break,
            built = link.builder.build(token.child_token()) => built,
        };

        match built {
            Ok(connection) => {
                log::debug!("[{info}] connection is up");
                table.set_sender(index, Some(connection.sender.clone()));
                if let RetryStrategy::Attempts(attempts, _) = retry {
                    attempts_left = attempts;
                }

                pump_inbound(connection, link.name.clone(), &inbound_tx, packet_loss, &token).await;
                table.set_sender(index, None);

                if token.is_cancelled() {
                    break;
                }
                log::warn!("[{info}] connection lost");
            }
            Err(err) => {
                log::warn!("[{info}] can't open connection: {err}");
            }
        }

        if !link.builder.is_repairable() {
            break;
        }
        let interval = match retry {
            RetryStrategy::Never => break,
            RetryStrategy::Attempts(_, interval) => {
                if attempts_left == 0 {
                    log::warn!("[{info}] no connection attempts left, giving up");
                    break;
                }
                attempts_left -= 1;
                interval
            }
            RetryStrategy::Always(interval) => interval,
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Forwards inbound frames of one connection onto the merged channel until
/// either side goes away.
async fn pump_inbound(
    connection: Connection,
    channel: Arc<str>,
    inbound_tx: &mpsc::Sender<IncomingEnvelope>,
    packet_loss: f64,
    token: &CancellationToken,
) {
    let Connection {
        info,
        mut receiver,
        handler,
        token: conn_token,
        ..
    } = connection;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            incoming = receiver.recv() => {
                let Some(incoming) = incoming else { break };
                if simulate_loss(packet_loss) {
                    continue;
                }
                let envelope = IncomingEnvelope {
                    channel: channel.clone(),
                    message: incoming.message,
                    address: incoming.address,
                };
                if inbound_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        }
    }

    conn_token.cancel();
    match handler.await {
        Ok(Ok(())) => log::debug!("[{info}] transport handler stopped"),
        Ok(Err(err)) => log::debug!("[{info}] transport handler exited with error: {err:?}"),
        Err(err) => log::error!("[{info}] transport handler failed: {err:?}"),
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                  Tests                                    //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod comm_tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::io::transport::LoopbackConnection;
    use crate::protocol::dialect::Ardupilotmega;
    use crate::protocol::heartbeat_spec;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:14550".parse().unwrap()
    }

    async fn wait_for_links(handle: &CommHandle, expected: usize) {
        for _ in 0..100 {
            if handle.active_links() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("links did not come up");
    }

    fn drain_consumer(
        mut rx: mpsc::Receiver<IncomingEnvelope>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            while rx.recv().await.is_some() {}
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_fails_over_to_the_next_link() {
        let (bad, _bad_peer) = LoopbackConnection::failing();
        let (good, mut good_peer) = LoopbackConnection::channel();

        let mut manager = CommunicationManager::new(255, 0.0, RetryStrategy::Never);
        manager.add(Arc::new(bad), DEFAULT_LINK_NAME);
        manager.add(Arc::new(good), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));
        wait_for_links(&handle, 2).await;

        handle
            .send_packet(&heartbeat_spec(), &Destination::on_default_link(peer_addr()))
            .await
            .unwrap();

        let (frame, target) = good_peer.next_sent().await.unwrap();
        assert_eq!(target, Some(peer_addr()));
        assert!(matches!(
            frame.decode::<Ardupilotmega>(),
            Ok(Ardupilotmega::Heartbeat(_))
        ));

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_fails_when_all_links_fail() {
        let (bad, _bad_peer) = LoopbackConnection::failing();

        let mut manager = CommunicationManager::new(255, 0.0, RetryStrategy::Never);
        manager.add(Arc::new(bad), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));
        wait_for_links(&handle, 1).await;

        let result = handle
            .send_packet(&heartbeat_spec(), &Destination::on_default_link(peer_addr()))
            .await;
        assert!(matches!(
            result,
            Err(Error::Net(NetworkError::SendFailed))
        ));

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sends_to_one_destination_keep_their_order() {
        let (link, mut peer) = LoopbackConnection::channel();

        let mut manager = CommunicationManager::new(255, 0.0, RetryStrategy::Never);
        manager.add(Arc::new(link), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));
        wait_for_links(&handle, 1).await;

        let destination = Destination::on_default_link(peer_addr());
        for _ in 0..3 {
            handle
                .send_packet(&heartbeat_spec(), &destination)
                .await
                .unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let (frame, _) = peer.next_sent().await.unwrap();
            sequences.push(frame.sequence());
        }
        assert!(
            sequences
                .windows(2)
                .all(|pair| pair[1] == pair[0].wrapping_add(1)),
            "frames arrived out of order: {sequences:?}"
        );

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn broadcast_tolerates_failing_links_when_asked_to() {
        let (bad, _bad_peer) = LoopbackConnection::failing();
        let (good, mut good_peer) = LoopbackConnection::channel();

        let mut manager = CommunicationManager::new(255, 0.0, RetryStrategy::Never);
        manager.add(Arc::new(bad), DEFAULT_LINK_NAME);
        manager.add(Arc::new(good), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));
        wait_for_links(&handle, 2).await;

        handle
            .broadcast_packet(&heartbeat_spec(), true)
            .await
            .unwrap();
        let (_, target) = good_peer.next_sent().await.unwrap();
        assert_eq!(target, None);

        let result = handle.broadcast_packet(&heartbeat_spec(), false).await;
        assert!(result.is_err());

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[derive(Debug, Default)]
    struct UnreachableConf {
        attempts: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ConnectionBuilder for UnreachableConf {
        fn info(&self) -> crate::io::ConnectionInfo {
            crate::io::ConnectionInfo::TcpClient {
                remote_addr: "nowhere:1".into(),
            }
        }

        fn is_repairable(&self) -> bool {
            true
        }

        async fn build(&self, _token: CancellationToken) -> Result<Connection> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Error::Other("host is unreachable".into()))
        }
    }

    #[tokio::test]
    async fn supervisor_retries_repairable_links_then_gives_up() {
        let conf = Arc::new(UnreachableConf::default());
        let attempts = conf.attempts.clone();

        let mut manager = CommunicationManager::new(
            255,
            0.0,
            RetryStrategy::Attempts(2, Duration::from_millis(10)),
        );
        manager.add(conf, DEFAULT_LINK_NAME);

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));

        for _ in 0..100 {
            if attempts.load(std::sync::atomic::Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The initial attempt plus two retries, then the supervisor gave up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_packet_loss_drops_outbound_silently() {
        let (link, mut peer) = LoopbackConnection::channel();

        let mut manager = CommunicationManager::new(255, 1.0, RetryStrategy::Never);
        manager.add(Arc::new(link), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(drain_consumer, vec![], token.clone()));
        wait_for_links(&handle, 1).await;

        handle
            .send_packet(&heartbeat_spec(), &Destination::on_default_link(peer_addr()))
            .await
            .unwrap();
        assert!(peer.try_next_sent().is_none());

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_packet_loss_drops_inbound_silently() {
        let (link, peer) = LoopbackConnection::channel();

        let mut manager = CommunicationManager::new(255, 1.0, RetryStrategy::Never);
        manager.add(Arc::new(link), DEFAULT_LINK_NAME);
        let handle = manager.handle();

        let (probe_tx, mut probe_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let run = tokio::spawn(manager.run(
            move |mut rx| async move {
                while let Some(envelope) = rx.recv().await {
                    let _ = probe_tx.send(envelope).await;
                }
                Ok(())
            },
            vec![],
            token.clone(),
        ));
        wait_for_links(&handle, 1).await;

        peer.inject(
            7,
            1,
            Ardupilotmega::Heartbeat(Default::default()),
            peer_addr(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(probe_rx.try_recv().is_err());

        token.cancel();
        run.await.unwrap().unwrap();
    }
}
