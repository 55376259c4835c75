use std::sync::Arc;

use crate::io::transport::{TcpClientConnection, UdpConnection};
use crate::io::ConnectionBuilder;

use crate::prelude::*;

/// Creates a connection from its URI representation.
///
/// Supported schemes:
///
/// - `udp://host:port` — bound UDP endpoint; an optional
///   `?broadcast=host:port` query selects an explicit broadcast address.
/// - `tcp://host:port` — outgoing TCP stream.
pub fn create_connection(uri: &str) -> Result<Arc<dyn ConnectionBuilder>> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("not a connection URI: {uri}")))?;

    let (address, query) = match rest.split_once('?') {
        Some((address, query)) => (address, Some(query)),
        None => (rest, None),
    };

    if address.is_empty() || !address.contains(':') {
        return Err(Error::Config(format!(
            "connection URI must contain a host:port address: {uri}"
        )));
    }

    match scheme {
        "udp" => {
            let mut connection = UdpConnection::new(address);
            if let Some(query) = query {
                for pair in query.split('&') {
                    match pair.split_once('=') {
                        Some(("broadcast", broadcast_addr)) => {
                            connection = connection.with_broadcast(broadcast_addr);
                        }
                        _ => {
                            return Err(Error::Config(format!(
                                "unsupported connection URI parameter: {pair}"
                            )))
                        }
                    }
                }
            }
            Ok(Arc::new(connection))
        }
        "tcp" => Ok(Arc::new(TcpClientConnection::new(address))),
        other => Err(Error::Config(format!(
            "unsupported connection URI scheme: {other}"
        ))),
    }
}
