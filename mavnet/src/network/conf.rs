use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_ID_FORMAT, DEFAULT_SYSTEM_ID};
use crate::protocol::SystemId;

/// Configuration of one MAVLink network, typically loaded from the server's
/// configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkSpecification {
    /// Unique identifier of the network.
    pub id: String,
    /// MAVLink system `ID` of the server within the network.
    #[serde(default = "default_system_id")]
    pub system_id: SystemId,
    /// Pattern used to derive drone identifiers; see [`IdFormat`].
    #[serde(default = "default_id_format")]
    pub id_format: String,
    /// Probability of dropping a frame in each direction, for testing
    /// degraded radio links.
    #[serde(default)]
    pub packet_loss: f64,
    /// Connection URIs, in send-preference order.
    #[serde(default)]
    pub connections: Vec<String>,
}

fn default_system_id() -> SystemId {
    DEFAULT_SYSTEM_ID
}

fn default_id_format() -> String {
    DEFAULT_ID_FORMAT.to_string()
}

/// Pattern that derives the application-level drone identifier from a
/// MAVLink system `ID` and the network identifier.
///
/// `{0}` stands for the system `ID`, `{1}` for the network identifier.
/// Numeric placeholders accept zero padding in the `{0:02}` form, so drone
/// `7` on network `alpha` formats as `07` with that pattern.
#[derive(Clone, Debug)]
pub struct IdFormat(String);

impl IdFormat {
    /// Creates a formatter from its pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Formats the identifier of one drone.
    pub fn format(&self, system_id: SystemId, network_id: &str) -> String {
        let mut result = String::with_capacity(self.0.len() + network_id.len());
        let mut chars = self.0.chars();

        while let Some(ch) = chars.next() {
            if ch != '{' {
                result.push(ch);
                continue;
            }

            let mut placeholder = String::new();
            for inner in chars.by_ref() {
                if inner == '}' {
                    break;
                }
                placeholder.push(inner);
            }

            let (index, width) = match placeholder.split_once(':') {
                Some((index, spec)) => (index, parse_zero_pad(spec)),
                None => (placeholder.as_str(), None),
            };

            match index {
                "0" | "" => match width {
                    Some(width) => {
                        result.push_str(&format!("{system_id:0width$}"));
                    }
                    None => result.push_str(&system_id.to_string()),
                },
                "1" => result.push_str(network_id),
                other => {
                    result.push('{');
                    result.push_str(other);
                    result.push('}');
                }
            }
        }

        result
    }
}

impl Default for IdFormat {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FORMAT)
    }
}

fn parse_zero_pad(spec: &str) -> Option<usize> {
    let digits = spec.strip_prefix('0')?;
    digits.parse().ok()
}
