use std::fmt;
use std::sync::Arc;

use crate::protocol::dialect::Ardupilotmega;
use crate::protocol::message::decode_text;
use crate::protocol::MavMessage;

/// A single message field value, as seen through the uniform accessor.
///
/// Numeric MAVLink fields map to [`FieldValue::UInt`] or [`FieldValue::Int`],
/// enum and bitmask fields map to their numeric representation, `char[]`
/// fields map to [`FieldValue::Str`] with NUL padding removed. Comparisons
/// between the signed and unsigned variants are value-based, and a
/// [`FieldValue::Bytes`] expectation matches a [`FieldValue::Str`] holding
/// the same UTF-8 text, mirroring the fact that the codec never yields raw
/// bytes for textual fields.
#[derive(Clone, Debug)]
pub enum FieldValue {
    /// Unsigned integer field (also enums and bitmasks).
    UInt(u64),
    /// Signed integer field.
    Int(i64),
    /// Floating-point field.
    Float(f64),
    /// Textual field.
    Str(String),
    /// Raw byte expectation, compared against text fields as UTF-8.
    Bytes(Vec<u8>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (UInt(a), UInt(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), Int(b)) | (Int(b), UInt(a)) => {
                i128::try_from(*a).map(|a| a == *b as i128).unwrap_or(false)
            }
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Str(text), Bytes(raw)) | (Bytes(raw), Str(text)) => {
                std::str::from_utf8(raw).map(|raw| raw == text).unwrap_or(false)
            }
            _ => false,
        }
    }
}

macro_rules! impl_field_value_from {
    ($variant:ident: $via:ty => $($ty:ty),+) => {
        $(impl From<$ty> for FieldValue {
            fn from(value: $ty) -> Self {
                FieldValue::$variant(value as $via)
            }
        })+
    };
}

impl_field_value_from!(UInt: u64 => u8, u16, u32, u64);
impl_field_value_from!(Int: i64 => i8, i16, i32, i64);
impl_field_value_from!(Float: f64 => f32, f64);

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// Predicate deciding whether an inbound message is the one a caller waits
/// for.
#[derive(Clone, Default)]
pub enum FrameMatcher {
    /// Matches every message of the expected type.
    #[default]
    Any,
    /// Matches when every listed field equals the expected value.
    Fields(Vec<(String, FieldValue)>),
    /// Matches when the callable returns `true`.
    Func(Arc<dyn Fn(&MavMessage) -> bool + Send + Sync>),
}

impl FrameMatcher {
    /// Creates a matcher expecting a single field value.
    pub fn field(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        FrameMatcher::Fields(vec![(name.into(), value.into())])
    }

    /// Adds one more expected field to the matcher.
    ///
    /// Converts [`FrameMatcher::Any`] into a field matcher; panics when
    /// called on a [`FrameMatcher::Func`].
    pub fn and_field(self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let mut fields = match self {
            FrameMatcher::Any => Vec::new(),
            FrameMatcher::Fields(fields) => fields,
            FrameMatcher::Func(_) => panic!("can't add field expectations to a callable matcher"),
        };
        fields.push((name.into(), value.into()));
        FrameMatcher::Fields(fields)
    }

    /// Creates a matcher from a callable predicate.
    pub fn func(predicate: impl Fn(&MavMessage) -> bool + Send + Sync + 'static) -> Self {
        FrameMatcher::Func(Arc::new(predicate))
    }

    pub(crate) fn matches(&self, message: &MavMessage) -> bool {
        match self {
            FrameMatcher::Any => true,
            FrameMatcher::Func(predicate) => predicate(message),
            FrameMatcher::Fields(fields) => fields.iter().all(|(name, expected)| {
                message
                    .field(name)
                    .map(|actual| actual == *expected)
                    .unwrap_or(false)
            }),
        }
    }
}

impl fmt::Debug for FrameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameMatcher::Any => write!(f, "Any"),
            FrameMatcher::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            FrameMatcher::Func(_) => write!(f, "Func(..)"),
        }
    }
}

/// Uniform accessor over the fields the dispatch layer and its callers match
/// on.
///
/// Derived from the MAVLink schema of the messages this core handles; fields
/// outside this set read as `None`, which never matches.
pub(crate) fn message_field(message: &Ardupilotmega, name: &str) -> Option<FieldValue> {
    match message {
        Ardupilotmega::Heartbeat(m) => match name {
            "type" => Some((m.type_ as u32).into()),
            "autopilot" => Some((m.autopilot as u32).into()),
            "base_mode" => Some(m.base_mode.bits().into()),
            "custom_mode" => Some(m.custom_mode.into()),
            "system_status" => Some((m.system_status as u32).into()),
            "mavlink_version" => Some(m.mavlink_version.into()),
            _ => None,
        },
        Ardupilotmega::CommandAck(m) => match name {
            "command" => Some((m.command as u32).into()),
            "result" => Some((m.result as u32).into()),
            "progress" => Some(m.progress.into()),
            "result_param2" => Some(m.result_param2.into()),
            _ => None,
        },
        Ardupilotmega::Statustext(m) => match name {
            "severity" => Some((m.severity as u32).into()),
            "text" => Some(FieldValue::Str(decode_text(&m.text))),
            _ => None,
        },
        Ardupilotmega::Timesync(m) => match name {
            "tc1" => Some(m.tc1.into()),
            "ts1" => Some(m.ts1.into()),
            _ => None,
        },
        Ardupilotmega::ParamValue(m) => match name {
            "param_id" => Some(FieldValue::Str(decode_text(&m.param_id))),
            "param_value" => Some(m.param_value.into()),
            "param_count" => Some(m.param_count.into()),
            "param_index" => Some(m.param_index.into()),
            _ => None,
        },
        Ardupilotmega::MissionAck(m) => match name {
            "type" => Some((m.type_ as u32).into()),
            _ => None,
        },
        Ardupilotmega::GlobalPositionInt(m) => match name {
            "time_boot_ms" => Some(m.time_boot_ms.into()),
            "lat" => Some(m.lat.into()),
            "lon" => Some(m.lon.into()),
            "alt" => Some(m.alt.into()),
            "relative_alt" => Some(m.relative_alt.into()),
            "hdg" => Some(m.hdg.into()),
            _ => None,
        },
        Ardupilotmega::GpsRawInt(m) => match name {
            "fix_type" => Some((m.fix_type as u32).into()),
            "lat" => Some(m.lat.into()),
            "lon" => Some(m.lon.into()),
            "alt" => Some(m.alt.into()),
            "satellites_visible" => Some(m.satellites_visible.into()),
            _ => None,
        },
        Ardupilotmega::SysStatus(m) => match name {
            "load" => Some(m.load.into()),
            "voltage_battery" => Some(m.voltage_battery.into()),
            "current_battery" => Some(m.current_battery.into()),
            "battery_remaining" => Some(m.battery_remaining.into()),
            _ => None,
        },
        Ardupilotmega::Data16(m) => match name {
            "type" => Some(m.type_.into()),
            "len" => Some(m.len.into()),
            _ => None,
        },
        Ardupilotmega::AutopilotVersion(m) => match name {
            "capabilities" => Some(m.capabilities.bits().into()),
            "flight_sw_version" => Some(m.flight_sw_version.into()),
            "board_version" => Some(m.board_version.into()),
            "vendor_id" => Some(m.vendor_id.into()),
            "product_id" => Some(m.product_id.into()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod matcher_tests {
    use super::*;

    use crate::protocol::dialect::enums::{MavCmd, MavResult};
    use crate::protocol::dialect::messages::{CommandAck, Statustext};

    fn command_ack(command: MavCmd, result: MavResult) -> MavMessage {
        MavMessage::new(
            7,
            1,
            Ardupilotmega::CommandAck(CommandAck {
                command,
                result,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn field_values_compare_across_signedness() {
        assert_eq!(FieldValue::UInt(400), FieldValue::Int(400));
        assert_eq!(FieldValue::Int(400), FieldValue::UInt(400));
        assert_ne!(FieldValue::Int(-1), FieldValue::UInt(u64::MAX));
        assert_ne!(FieldValue::UInt(1), FieldValue::Str("1".to_string()));
    }

    #[test]
    fn byte_expectations_match_decoded_text() {
        assert_eq!(
            FieldValue::Bytes(b"ARMED".to_vec()),
            FieldValue::Str("ARMED".to_string())
        );
        assert_ne!(
            FieldValue::Bytes(vec![0xff, 0xfe]),
            FieldValue::Str("??".to_string())
        );
    }

    #[test]
    fn field_matcher_requires_all_fields() {
        let message = command_ack(MavCmd::ComponentArmDisarm, MavResult::Accepted);

        let matcher = FrameMatcher::field("command", MavCmd::ComponentArmDisarm as u32);
        assert!(matcher.matches(&message));

        let matcher = matcher.and_field("result", MavResult::Denied as u32);
        assert!(!matcher.matches(&message));
    }

    #[test]
    fn missing_field_never_matches() {
        let message = command_ack(MavCmd::ComponentArmDisarm, MavResult::Accepted);
        assert!(!FrameMatcher::field("no_such_field", 1u32).matches(&message));
    }

    #[test]
    fn wildcard_and_callable_matchers() {
        let message = command_ack(MavCmd::NavTakeoff, MavResult::Accepted);

        assert!(FrameMatcher::Any.matches(&message));
        assert!(FrameMatcher::func(|m| m.system_id() == 7).matches(&message));
        assert!(!FrameMatcher::func(|m| m.system_id() == 8).matches(&message));
    }

    #[test]
    fn text_field_reads_without_padding() {
        let mut text = [0u8; 50];
        text[..12].copy_from_slice(b"PreArm: gyro");
        let message = MavMessage::new(
            3,
            1,
            Ardupilotmega::Statustext(Statustext {
                text,
                ..Default::default()
            }),
        );
        assert_eq!(
            message.field("text"),
            Some(FieldValue::Str("PreArm: gyro".to_string()))
        );
    }
}
