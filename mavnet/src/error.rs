//! # Mavnet errors
//!
//! All fallible `mavnet` functions return [`Result`]. The top-level error is
//! [`Error`]; domain errors that callers are expected to match on live in
//! [`NetworkError`]. Errors reported by the MAVLink codec are re-exported
//! from [`mavio`](https://docs.rs/mavio/latest/mavio/error/) and wrapped as
//! [`Error::Mavlink`].

use std::sync::Arc;

use mavio::protocol::SystemId;

/// <sup>From [`mavio`](https://docs.rs/mavio/latest/mavio/error/)</sup>
/// Errors produced by the MAVLink codec.
#[doc(inline)]
pub use mavio::error::Error as CodecError;

/// Mavnet result type.
pub type Result<T> = core::result::Result<T, Error>;

/// All errors generated by mavnet.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// [`std::io::Error`] wrapper.
    #[error("I/O error: {0:?}")]
    Io(Arc<std::io::Error>),

    /// MAVLink frame encoding/decoding error.
    #[error("MAVLink codec error: {0}")]
    Mavlink(#[from] CodecError),

    /// Network-level errors surfaced to callers.
    #[error("network error: {0}")]
    Net(#[from] NetworkError),

    /// Invalid network or connection configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Attempt to read from or write into a closed channel.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Other errors.
    #[error("error: {0}")]
    Other(String),
}

/// Errors related to the state of a MAVLink network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The network is not running and cannot serve requests.
    #[error("network is not running")]
    Inactive,

    /// Targeted send to a UAV the network has never seen.
    #[error("UAV with system ID {0} has no address in this network")]
    NoAddress(SystemId),

    /// All candidate connections for a send have failed.
    #[error("sending failed on all suitable connections")]
    SendFailed,

    /// The caller's scope exited or the network shut down before a matching
    /// reply arrived.
    #[error("reply matcher cancelled before a matching packet arrived")]
    MatcherCancelled,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}
