use crate::io::ConnectionInfo;

/// What a registered connection is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPurpose {
    /// Radio or network link towards the UAVs.
    UavRadioLink,
    /// Anything else.
    Other,
}

/// Application-side registry of connections.
///
/// Networks register every link they manage for the duration of their `run`
/// call so the application can expose connection health to its clients. The
/// returned scope unregisters the connection when dropped.
pub trait ConnectionRegistry: Send + Sync {
    /// Registers a connection under a human-readable name.
    fn use_connection(
        &self,
        info: &ConnectionInfo,
        name: &str,
        description: &str,
        purpose: ConnectionPurpose,
    ) -> ConnectionScope;
}

/// Guard that keeps a connection registration alive.
pub struct ConnectionScope(Option<Box<dyn FnOnce() + Send>>);

impl ConnectionScope {
    /// Creates a scope that runs the given cleanup when dropped.
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_drop)))
    }

    /// Creates a scope with no cleanup.
    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}
