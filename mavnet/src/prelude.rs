//! # Mavnet prelude
//!
//! Commonly used mavnet entities, ready for a glob import.

pub use crate::error::{Error, NetworkError, Result};

pub use crate::comm::{Destination, RetryStrategy};
pub use crate::io::{create_connection, ConnectionBuilder};
pub use crate::network::{
    Driver, IdFormat, MavLinkNetwork, NetworkDeps, NetworkSpecification, ResponseMatch,
    UavHandler, UavRegistry,
};
pub use crate::protocol::{heartbeat_spec, FieldValue, FrameMatcher, MavMessage, MessageSpec};
pub use crate::signals::SignalHub;
