//! # MAVLink protocol entities
//!
//! The decoded message model is the `ardupilotmega` dialect generated by
//! [MAVSpec](https://crates.io/crates/mavspec) and re-exported from
//! [`mavio`]. This module wraps it into the envelope and matcher types used
//! by the dispatch layer.

mod matcher;
mod message;
mod spec;

pub use matcher::{FieldValue, FrameMatcher};
pub use message::MavMessage;
pub use spec::{heartbeat_spec, MessageSpec};

pub(crate) use message::{decode_text, message_name};

/// <sup>From [`mavio`](https://docs.rs/mavio/latest/mavio/)</sup>
/// MAVLink dialect used throughout this crate.
#[doc(inline)]
pub use mavio::dialects::ardupilotmega as dialect;

#[doc(inline)]
pub use mavio::protocol::{ComponentId, MavLinkVersion, MessageId, SystemId};
