//! # MAVLink networks
//!
//! A [`MavLinkNetwork`] multiplexes a set of MAVLink connections into a
//! single logical namespace of drones: the system `ID` of a message received
//! on any of its connections refers to the same vehicle, while the same
//! system `ID` on a different network may be a completely different aircraft.
//!
//! While running, a network dispatches inbound messages to per-vehicle
//! handlers, correlates replies with pending [`expect_packet`] scopes,
//! broadcasts heartbeats once a second and forwards RTK corrections to the
//! drones and to the [`rtk_fragments`](crate::signals::SignalHub) signal.
//!
//! [`expect_packet`]: MavLinkNetwork::expect_packet

mod conf;
mod dispatch;
mod matchers;
mod uav;

pub use conf::{IdFormat, NetworkSpecification};
pub use matchers::PacketExpectation;
pub use uav::{Driver, UavHandler, UavRegistry};

use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::comm::{CommHandle, CommunicationManager, Destination, RetryStrategy};
use crate::consts::{
    AUTOPILOT_COMPONENT_ID, DEFAULT_LINK_NAME, DEFAULT_SYSTEM_ID, HEARTBEAT_INTERVAL,
    LINK_RECONNECT_INTERVAL,
};
use crate::io::{ConnectionBuilder, ConnectionPurpose, ConnectionRegistry};
use crate::network::dispatch::Dispatcher;
use crate::network::matchers::MatcherTable;
use crate::network::uav::UavDirectory;
use crate::protocol::{heartbeat_spec, FrameMatcher, MavMessage, MessageId, MessageSpec, SystemId};
use crate::rtk::RtkCorrectionPacketEncoder;
use crate::signals::{RtkFragmentsEvent, SignalHub};

use crate::prelude::*;

/// Collaborators a network needs while it is running.
pub struct NetworkDeps {
    /// Factory for per-vehicle handlers.
    pub driver: Arc<dyn Driver>,
    /// Application-side UAV registry.
    pub registry: Arc<dyn UavRegistry>,
    /// Optional application-side connection registry.
    pub connections: Option<Arc<dyn ConnectionRegistry>>,
    /// Signals the network emits on.
    pub signals: SignalHub,
    /// How dropped connections are reopened.
    pub retry: RetryStrategy,
}

impl NetworkDeps {
    /// Creates the dependency set from its two mandatory collaborators.
    pub fn new(driver: Arc<dyn Driver>, registry: Arc<dyn UavRegistry>) -> Self {
        Self {
            driver,
            registry,
            connections: None,
            signals: SignalHub::new(),
            retry: RetryStrategy::Always(LINK_RECONNECT_INTERVAL),
        }
    }

    /// Registers every connection with the given application registry for
    /// the duration of the run.
    pub fn with_connection_registry(mut self, registry: Arc<dyn ConnectionRegistry>) -> Self {
        self.connections = Some(registry);
        self
    }

    /// Uses an application-wide signal hub instead of a private one.
    pub fn with_signals(mut self, signals: SignalHub) -> Self {
        self.signals = signals;
        self
    }

    /// Overrides the reconnection strategy.
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }
}

/// A reply to wait for: the expected message type plus an optional content
/// predicate.
#[derive(Clone, Debug)]
pub struct ResponseMatch {
    /// Expected message type.
    pub message_id: MessageId,
    /// Content predicate.
    pub matcher: FrameMatcher,
}

impl ResponseMatch {
    /// Expects any message of the given type.
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            matcher: FrameMatcher::Any,
        }
    }

    /// Expects a message of the given type satisfying the matcher.
    pub fn matching(message_id: MessageId, matcher: FrameMatcher) -> Self {
        Self {
            message_id,
            matcher,
        }
    }
}

struct NetworkRuntime {
    handle: CommHandle,
    matchers: Arc<MatcherTable>,
    uavs: Arc<UavDirectory>,
    signals: SignalHub,
}

/// Representation of a MAVLink network.
///
/// Constructed from a [`NetworkSpecification`] or assembled manually, then
/// driven by [`run`](MavLinkNetwork::run). The send and expect APIs are
/// usable from any task while the network runs; without a running network
/// they fail with [`NetworkError::Inactive`].
pub struct MavLinkNetwork {
    id: String,
    system_id: SystemId,
    id_format: IdFormat,
    packet_loss: f64,
    connections: Mutex<Vec<Arc<dyn ConnectionBuilder>>>,
    rtk_encoder: Mutex<RtkCorrectionPacketEncoder>,
    runtime: RwLock<Option<Arc<NetworkRuntime>>>,
}

impl MavLinkNetwork {
    /// Creates an empty network with the given identifier.
    ///
    /// Network identifiers must be unique within one server process.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_id: DEFAULT_SYSTEM_ID,
            id_format: IdFormat::default(),
            packet_loss: 0.0,
            connections: Mutex::new(Vec::new()),
            rtk_encoder: Mutex::new(RtkCorrectionPacketEncoder::new()),
            runtime: RwLock::new(None),
        }
    }

    /// Creates a network from its configuration.
    pub fn from_specification(spec: &NetworkSpecification) -> Result<Self> {
        let mut network = Self::new(spec.id.clone())
            .with_system_id(spec.system_id)
            .with_id_format(IdFormat::new(spec.id_format.clone()))
            .with_packet_loss(spec.packet_loss);

        for uri in &spec.connections {
            let connection = crate::io::create_connection(uri)?;
            network.connections.get_mut().expect("poisoned connections").push(connection);
        }

        Ok(network)
    }

    /// Sets the MAVLink system `ID` the server uses on this network.
    pub fn with_system_id(mut self, system_id: SystemId) -> Self {
        self.system_id = system_id;
        self
    }

    /// Sets the drone identifier format.
    pub fn with_id_format(mut self, id_format: IdFormat) -> Self {
        self.id_format = id_format;
        self
    }

    /// Sets the simulated packet loss ratio; values below zero are clamped.
    pub fn with_packet_loss(mut self, packet_loss: f64) -> Self {
        self.packet_loss = packet_loss.max(0.0);
        self
    }

    /// Adds a connection to this network.
    ///
    /// Order matters: earlier connections are preferred for sending.
    pub fn add_connection(&self, connection: Arc<dyn ConnectionBuilder>) {
        self.connections
            .lock()
            .expect("poisoned connections")
            .push(connection);
    }

    /// The unique identifier of this network.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `true` while [`run`](MavLinkNetwork::run) is active.
    pub fn is_running(&self) -> bool {
        self.runtime.read().expect("poisoned runtime slot").is_some()
    }

    /// Runs the network until the token is cancelled.
    ///
    /// Installs the runtime state, supervises the connections, dispatches
    /// inbound traffic and broadcasts heartbeats. On the way out every
    /// pending packet expectation is cancelled and the runtime state is torn
    /// down again.
    pub async fn run(&self, deps: NetworkDeps, token: CancellationToken) -> Result<()> {
        let builders = self.connections.lock().expect("poisoned connections").clone();

        if self.packet_loss > 0.0 {
            let percentage = (self.packet_loss.min(1.0) * 100.0).round();
            log::warn!(
                "Simulating {percentage}% packet loss on MAVLink network {}",
                self.id
            );
        }

        let mut manager = CommunicationManager::new(self.system_id, self.packet_loss, deps.retry);

        // Keeps the application's connection registry entries alive for the
        // duration of the run.
        let mut scopes = Vec::new();
        for (index, builder) in builders.iter().enumerate() {
            manager.add(builder.clone(), DEFAULT_LINK_NAME);

            if let Some(registry) = &deps.connections {
                let full_id = if builders.len() > 1 {
                    if self.id.is_empty() {
                        index.to_string()
                    } else {
                        format!("{}/{index}", self.id)
                    }
                } else {
                    self.id.clone()
                };
                let kind = if builder.is_listener() {
                    "MAVLink listener"
                } else {
                    "MAVLink connection"
                };
                let name = if full_id.is_empty() {
                    "MAVLink".to_string()
                } else {
                    format!("MAVLink: {full_id}")
                };
                let description = if full_id.is_empty() {
                    kind.to_string()
                } else {
                    format!("{kind} ({full_id})")
                };
                scopes.push(registry.use_connection(
                    &builder.info(),
                    &name,
                    &description,
                    ConnectionPurpose::UavRadioLink,
                ));
            }
        }

        let handle = manager.handle();
        let runtime = Arc::new(NetworkRuntime {
            handle: handle.clone(),
            matchers: Arc::new(MatcherTable::new()),
            uavs: Arc::new(UavDirectory::new(
                self.id.clone(),
                self.id_format.clone(),
                deps.driver.clone(),
                deps.registry.clone(),
            )),
            signals: deps.signals.clone(),
        });

        {
            let mut slot = self.runtime.write().expect("poisoned runtime slot");
            if slot.is_some() {
                return Err(Error::Other(format!(
                    "MAVLink network {} is already running",
                    self.id
                )));
            }
            *slot = Some(runtime.clone());
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.id.clone(),
            runtime.matchers.clone(),
            runtime.uavs.clone(),
        ));

        let result = manager
            .run(
                move |inbound| dispatcher.run(inbound),
                vec![Box::pin(generate_heartbeats(handle))],
                token,
            )
            .await;

        runtime.matchers.cancel_all();
        *self.runtime.write().expect("poisoned runtime slot") = None;
        drop(scopes);

        result
    }

    /// Sets up a scope that waits for a MAVLink packet of a given type,
    /// optionally matching its content and the system `ID` of its sender.
    ///
    /// The matcher is installed immediately and removed when the returned
    /// [`PacketExpectation`] is dropped.
    pub fn expect_packet(
        &self,
        message_id: MessageId,
        matcher: FrameMatcher,
        system_id: Option<SystemId>,
    ) -> Result<PacketExpectation> {
        let runtime = self.runtime()?;
        Ok(runtime.matchers.expect(message_id, matcher, system_id))
    }

    /// Broadcasts a message to all UAVs in the network.
    pub async fn broadcast_packet(&self, spec: &MessageSpec) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.handle.broadcast_packet(spec, false).await
    }

    /// Sends a message to the given UAV.
    pub async fn send_packet(&self, spec: MessageSpec, target: SystemId) -> Result<()> {
        let runtime = self.runtime()?;
        let (spec, destination) = self.prepare_targeted(&runtime, spec, target)?;
        runtime.handle.send_packet(&spec, &destination).await
    }

    /// Sends a message to the given UAV and waits for a matching response
    /// from it.
    ///
    /// The response matcher is installed before the message goes out, so a
    /// fast reply cannot be lost between the two steps.
    pub async fn send_packet_and_wait(
        &self,
        spec: MessageSpec,
        target: SystemId,
        response: ResponseMatch,
    ) -> Result<MavMessage> {
        let runtime = self.runtime()?;
        let (spec, destination) = self.prepare_targeted(&runtime, spec, target)?;

        let mut expectation =
            runtime
                .matchers
                .expect(response.message_id, response.matcher, Some(target));
        runtime.handle.send_packet(&spec, &destination).await?;
        expectation.wait().await
    }

    /// Sends a message to the given UAV and races a labeled set of possible
    /// responses from it; the first one to arrive wins.
    pub async fn send_packet_and_wait_one_of(
        &self,
        spec: MessageSpec,
        target: SystemId,
        responses: Vec<(String, ResponseMatch)>,
    ) -> Result<(String, MavMessage)> {
        if responses.is_empty() {
            return Err(Error::Other("no responses to wait for".into()));
        }

        let runtime = self.runtime()?;
        let (spec, destination) = self.prepare_targeted(&runtime, spec, target)?;

        let mut expectations: Vec<(String, PacketExpectation)> = responses
            .into_iter()
            .map(|(key, response)| {
                let expectation =
                    runtime
                        .matchers
                        .expect(response.message_id, response.matcher, Some(target));
                (key, expectation)
            })
            .collect();

        runtime.handle.send_packet(&spec, &destination).await?;

        let races = expectations
            .iter_mut()
            .map(|(key, expectation)| {
                let key = key.clone();
                async move { (key, expectation.wait().await) }.boxed()
            })
            .collect::<Vec<_>>();

        let ((key, result), _, _) = futures::future::select_all(races).await;
        result.map(|message| (key, message))
    }

    /// Sends a heartbeat targeted at the given UAV.
    pub async fn send_heartbeat(&self, target: SystemId) -> Result<()> {
        let runtime = self.runtime()?;
        let address = runtime
            .uavs
            .address_of(target)
            .ok_or(NetworkError::NoAddress(target))?;
        runtime
            .handle
            .send_packet(&heartbeat_spec(), &Destination::on_default_link(address))
            .await
    }

    /// Forwards an RTK correction packet to the drones in this network and
    /// publishes the encoded fragments on the `rtk_fragments` signal.
    ///
    /// Does nothing when the network is not running.
    pub fn enqueue_rtk_correction_packet(&self, packet: &[u8]) {
        let Ok(runtime) = self.runtime() else {
            return;
        };

        let messages = self
            .rtk_encoder
            .lock()
            .expect("poisoned RTK encoder")
            .encode(packet);
        if messages.is_empty() {
            return;
        }

        for message in &messages {
            let spec = MessageSpec::new(crate::protocol::dialect::Ardupilotmega::GpsRtcmData(
                message.clone(),
            ));
            if let Err(err) = runtime.handle.enqueue_broadcast_packet(&spec) {
                log::debug!("[{}] can't enqueue RTK fragment: {err}", self.id);
            }
        }

        runtime.signals.rtk_fragments.emit(&RtkFragmentsEvent {
            sender: self.id.clone(),
            messages,
        });
    }

    fn runtime(&self) -> Result<Arc<NetworkRuntime>> {
        self.runtime
            .read()
            .expect("poisoned runtime slot")
            .clone()
            .ok_or_else(|| NetworkError::Inactive.into())
    }

    fn prepare_targeted(
        &self,
        runtime: &NetworkRuntime,
        mut spec: MessageSpec,
        target: SystemId,
    ) -> Result<(MessageSpec, Destination)> {
        spec.set_target(target, AUTOPILOT_COMPONENT_ID);
        if let Some(uav) = runtime.uavs.get(target) {
            spec.set_version(uav.mavlink_version());
        }

        let address = runtime
            .uavs
            .address_of(target)
            .ok_or(NetworkError::NoAddress(target))?;
        Ok((spec, Destination::on_default_link(address)))
    }
}

/// Broadcasts a heartbeat on every connection once a second.
///
/// A tick missed under back-pressure is skipped, not queued, so the cadence
/// never drifts.
async fn generate_heartbeats(handle: CommHandle) {
    let spec = heartbeat_spec();
    let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticks.tick().await;
        if let Err(err) = handle.broadcast_packet(&spec, true).await {
            log::trace!("heartbeat can't be broadcast: {err:?}");
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                  Tests                                    //
///////////////////////////////////////////////////////////////////////////////
