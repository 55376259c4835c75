//! # Common constants

use std::time::Duration;

use mavio::protocol::{ComponentId, SystemId};

/// Default MAVLink system `ID` of the server within a network.
pub const DEFAULT_SYSTEM_ID: SystemId = 255;
/// MAVLink component `ID` the server identifies itself with (`MISSIONPLANNER`).
pub const GCS_COMPONENT_ID: ComponentId = 190;
/// MAVLink component `ID` of the primary autopilot (`AUTOPILOT1`).
///
/// Messages originating from any other component are ignored by the dispatch
/// loop.
pub const AUTOPILOT_COMPONENT_ID: ComponentId = 1;

/// Interval between two heartbeats broadcast to the network.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default symbolic name of a communication link within a network.
pub const DEFAULT_LINK_NAME: &str = "";
/// Default pattern used to derive drone identifiers from MAVLink system `ID`s.
pub const DEFAULT_ID_FORMAT: &str = "{0}";

/// `type` marker of `DATA16` packets that carry drone show status reports.
pub const DRONE_SHOW_STATUS_TYPE: u8 = 0x5b;

/// Default port of the Sidekick fan-out listener.
pub const DEFAULT_SIDEKICK_PORT: u16 = 5919;
/// Capacity of the queue between one Sidekick subscriber and the fan-out
/// service.
///
/// RTK corrections become obsolete quickly, so a congested subscriber must
/// not hold many of them; at the same time correction requests come in
/// bursts, so a queue of one or two slots would drop too eagerly.
pub const SIDEKICK_CHANNEL_CAPACITY: usize = 16;
/// Interval between two keepalive lines sent to an idle Sidekick subscriber.
pub const SIDEKICK_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Service name under which the Sidekick listener is advertised over SSDP.
pub const SIDEKICK_SERVICE_NAME: &str = "sidekick-server";

pub(crate) const CONN_INCOMING_CHAN_CAPACITY: usize = 1024;
pub(crate) const CONN_OUTGOING_CHAN_CAPACITY: usize = 1024;

pub(crate) const LINK_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
