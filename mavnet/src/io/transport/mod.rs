//! # Bundled transports
//!
//! - [`UdpConnection`] — bound UDP endpoint, the usual carrier for drone
//!   swarms; tracks peers it has heard from and can broadcast to them or to
//!   a configured broadcast address.
//! - [`TcpClientConnection`] — outgoing TCP stream, e.g. towards a simulator.
//! - [`LoopbackConnection`] — in-process link for tests and simulators.

mod loopback;
mod tcp;
mod udp;

pub use loopback::{LoopbackConnection, LoopbackPeer};
pub use tcp::TcpClientConnection;
pub use udp::UdpConnection;
