use std::borrow::Cow;

use mavio::protocol::{ComponentId, MessageId, MessageSpec, SystemId};
use mavio::Frame;

use crate::protocol::dialect::Ardupilotmega;
use crate::protocol::matcher::message_field;
use crate::protocol::FieldValue;

use crate::prelude::*;

/// A decoded MAVLink message together with the identity of its sender.
///
/// This is the unit the dispatch loop operates on: connections decode raw
/// frames into [`MavMessage`] values before handing them over, so matchers
/// and per-type handlers never deal with wire-level framing.
#[derive(Clone, Debug)]
pub struct MavMessage {
    system_id: SystemId,
    component_id: ComponentId,
    message: Ardupilotmega,
}

impl MavMessage {
    /// Creates a new message envelope.
    pub fn new(system_id: SystemId, component_id: ComponentId, message: Ardupilotmega) -> Self {
        Self {
            system_id,
            component_id,
            message,
        }
    }

    /// Decodes a received frame into a message envelope.
    pub fn from_frame<V: mavio::protocol::MaybeVersioned>(frame: &Frame<V>) -> Result<Self> {
        Ok(Self {
            system_id: frame.system_id(),
            component_id: frame.component_id(),
            message: frame.decode()?,
        })
    }

    /// MAVLink system `ID` of the sender.
    #[inline]
    pub fn system_id(&self) -> SystemId {
        self.system_id
    }

    /// MAVLink component `ID` of the sender.
    #[inline]
    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    /// Message `ID` within the dialect.
    #[inline]
    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }

    /// The decoded message payload.
    #[inline]
    pub fn message(&self) -> &Ardupilotmega {
        &self.message
    }

    /// Looks up a message field by its MAVLink schema name.
    ///
    /// Returns `None` when the message has no such field or the field is not
    /// covered by the accessor.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        message_field(&self.message, name)
    }
}

/// Decodes a fixed-size `char[]` message field into a string, dropping the
/// NUL padding.
pub(crate) fn decode_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&byte| byte == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Human-readable name of a message type, used in log lines only.
pub(crate) fn message_name(id: MessageId) -> Cow<'static, str> {
    let name = match id {
        0 => "HEARTBEAT",
        1 => "SYS_STATUS",
        22 => "PARAM_VALUE",
        24 => "GPS_RAW_INT",
        33 => "GLOBAL_POSITION_INT",
        47 => "MISSION_ACK",
        76 => "COMMAND_LONG",
        77 => "COMMAND_ACK",
        111 => "TIMESYNC",
        148 => "AUTOPILOT_VERSION",
        169 => "DATA16",
        233 => "GPS_RTCM_DATA",
        253 => "STATUSTEXT",
        other => return Cow::Owned(format!("#{other}")),
    };
    Cow::Borrowed(name)
}

#[cfg(test)]
mod message_tests {
    use super::*;

    use crate::protocol::dialect::messages::Heartbeat;

    #[test]
    fn text_decoding_stops_at_nul() {
        let mut raw = [0u8; 50];
        raw[..5].copy_from_slice(b"hello");
        assert_eq!(decode_text(&raw), "hello");
        assert_eq!(decode_text(b"full"), "full");
        assert_eq!(decode_text(&[0u8; 8]), "");
    }

    #[test]
    fn envelope_reports_sender_identity() {
        let message = MavMessage::new(7, 1, Ardupilotmega::Heartbeat(Heartbeat::default()));
        assert_eq!(message.system_id(), 7);
        assert_eq!(message.component_id(), 1);
        assert_eq!(message.message_id(), 0);
    }

    #[test]
    fn names_cover_handled_types() {
        assert_eq!(message_name(0), "HEARTBEAT");
        assert_eq!(message_name(253), "STATUSTEXT");
        assert_eq!(message_name(60000), "#60000");
    }
}
