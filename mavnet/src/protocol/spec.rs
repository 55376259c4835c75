use mavio::protocol::{ComponentId, Dialect, MavLinkVersion, SystemId};

use crate::protocol::dialect::enums::{MavAutopilot, MavState, MavType};
use crate::protocol::dialect::messages::Heartbeat;
use crate::protocol::dialect::Ardupilotmega;

/// Specification of an outbound MAVLink message.
///
/// Wraps the message payload together with the MAVLink version it should be
/// spoken with. Targeted sends rewrite the `target_system` /
/// `target_component` fields of the payload before the frame is built.
#[derive(Clone, Debug)]
pub struct MessageSpec {
    message: Ardupilotmega,
    version: MavLinkVersion,
}

impl MessageSpec {
    /// Creates a specification for the given message payload.
    pub fn new(message: Ardupilotmega) -> Self {
        Self {
            message,
            version: MavLinkVersion::V2,
        }
    }

    /// The message payload.
    pub fn message(&self) -> &Ardupilotmega {
        &self.message
    }

    /// MAVLink version the target is known to speak.
    ///
    /// Wire framing is always MAVLink 2; this value records the version
    /// reported by the recipient for protocol-level decisions.
    pub fn version(&self) -> MavLinkVersion {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: MavLinkVersion) {
        self.version = version;
    }

    /// Rewrites the payload's addressing fields for a targeted send.
    ///
    /// Messages without addressing fields are left untouched.
    pub(crate) fn set_target(&mut self, system: SystemId, component: ComponentId) {
        match &mut self.message {
            Ardupilotmega::CommandLong(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::CommandInt(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::ParamRequestRead(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::ParamRequestList(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::ParamSet(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::MissionRequestList(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::MissionAck(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::Timesync(m) => {
                m.target_system = system;
                m.target_component = component;
            }
            Ardupilotmega::SetMode(m) => {
                m.target_system = system;
            }
            _ => {}
        }
    }
}

impl From<Ardupilotmega> for MessageSpec {
    fn from(message: Ardupilotmega) -> Self {
        Self::new(message)
    }
}

/// Heartbeat the server broadcasts to keep vehicles streaming telemetry.
pub fn heartbeat_spec() -> MessageSpec {
    MessageSpec::new(Ardupilotmega::Heartbeat(Heartbeat {
        type_: MavType::Gcs,
        autopilot: MavAutopilot::Invalid,
        base_mode: Default::default(),
        custom_mode: 0,
        system_status: MavState::Standby,
        mavlink_version: Ardupilotmega::version().unwrap_or_default(),
    }))
}

#[cfg(test)]
mod spec_tests {
    use super::*;

    use crate::protocol::dialect::enums::MavCmd;
    use crate::protocol::dialect::messages::{CommandLong, GlobalPositionInt};

    #[test]
    fn targeted_fields_are_rewritten() {
        let mut spec = MessageSpec::new(Ardupilotmega::CommandLong(CommandLong {
            command: MavCmd::ComponentArmDisarm,
            param1: 1.0,
            ..Default::default()
        }));
        spec.set_target(7, 1);

        match spec.message() {
            Ardupilotmega::CommandLong(m) => {
                assert_eq!(m.target_system, 7);
                assert_eq!(m.target_component, 1);
                assert_eq!(m.command, MavCmd::ComponentArmDisarm);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn untargeted_messages_are_untouched() {
        let message = Ardupilotmega::GlobalPositionInt(GlobalPositionInt::default());
        let mut spec = MessageSpec::new(message.clone());
        spec.set_target(7, 1);
        assert!(matches!(
            spec.message(),
            Ardupilotmega::GlobalPositionInt(_)
        ));
    }

    #[test]
    fn heartbeat_identifies_a_ground_station() {
        let spec = heartbeat_spec();
        match spec.message() {
            Ardupilotmega::Heartbeat(m) => {
                assert_eq!(m.type_, MavType::Gcs);
                assert_eq!(m.autopilot, MavAutopilot::Invalid);
                assert_eq!(m.custom_mode, 0);
                assert_eq!(m.system_status, MavState::Standby);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
