//! # I/O abstractions
//!
//! Transports deliver decoded MAVLink messages tagged with the peer address
//! they came from and accept pre-built frames addressed either to one peer or
//! to the whole broadcast domain of the link. Concrete transports live in
//! [`transport`]; the [`CommunicationManager`](crate::comm) drives them.

mod connection;
mod registry;
pub mod transport;
mod uri;

pub use connection::{
    Connection, ConnectionBuilder, ConnectionInfo, IncomingFrame, OutgoingFrame, SendTarget,
};
pub use registry::{ConnectionPurpose, ConnectionRegistry, ConnectionScope};
pub use uri::create_connection;
