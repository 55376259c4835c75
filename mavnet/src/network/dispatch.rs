use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::comm::IncomingEnvelope;
use crate::consts::{AUTOPILOT_COMPONENT_ID, DRONE_SHOW_STATUS_TYPE};
use crate::network::matchers::MatcherTable;
use crate::network::uav::UavDirectory;
use crate::protocol::dialect::enums::{MavSeverity, MavType};
use crate::protocol::dialect::messages::{Data16, Statustext, Timesync};
use crate::protocol::dialect::Ardupilotmega;
use crate::protocol::{decode_text, message_name, MessageId};

use crate::prelude::*;

/// The inbound half of a running network: resolves matchers and feeds
/// per-type handlers.
pub(crate) struct Dispatcher {
    network_id: String,
    matchers: Arc<MatcherTable>,
    uavs: Arc<UavDirectory>,
    // Message types without a handler are reported once, then silenced.
    unhandled: Mutex<HashSet<MessageId>>,
}

impl Dispatcher {
    pub(crate) fn new(
        network_id: String,
        matchers: Arc<MatcherTable>,
        uavs: Arc<UavDirectory>,
    ) -> Self {
        Self {
            network_id,
            matchers,
            uavs,
            unhandled: Mutex::new(HashSet::new()),
        }
    }

    /// Consumes the merged inbound channel until it closes.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<IncomingEnvelope>,
    ) -> Result<()> {
        while let Some(envelope) = inbound.recv().await {
            self.handle(&envelope);
        }
        Ok(())
    }

    /// Processes a single inbound message.
    pub(crate) fn handle(&self, envelope: &IncomingEnvelope) {
        // Only the autopilot component is of interest; cameras, companion
        // computers and the like are filtered out before anything else.
        if envelope.message.component_id() != AUTOPILOT_COMPONENT_ID {
            return;
        }

        // Matchers resolve before the per-type side effects run.
        self.matchers.resolve(&envelope.message);

        if let Err(err) = self.dispatch(envelope) {
            log::error!(
                "[{}] error while handling MAVLink message of type {}: {err}",
                self.network_id,
                message_name(envelope.message.message_id())
            );
        }
    }

    fn dispatch(&self, envelope: &IncomingEnvelope) -> Result<()> {
        match envelope.message.message() {
            Ardupilotmega::Heartbeat(message) => {
                if !is_vehicle(message.type_) {
                    return Ok(());
                }
                if let Some(uav) = self.ensure_uav(envelope) {
                    uav.handle_heartbeat(message)?;
                }
                Ok(())
            }
            Ardupilotmega::GlobalPositionInt(message) => {
                if let Some(uav) = self.ensure_uav(envelope) {
                    uav.handle_global_position_int(message)?;
                }
                Ok(())
            }
            Ardupilotmega::GpsRawInt(message) => {
                if let Some(uav) = self.ensure_uav(envelope) {
                    uav.handle_gps_raw_int(message)?;
                }
                Ok(())
            }
            Ardupilotmega::SysStatus(message) => {
                if let Some(uav) = self.ensure_uav(envelope) {
                    uav.handle_sys_status(message)?;
                }
                Ok(())
            }
            Ardupilotmega::AutopilotVersion(message) => {
                if let Some(uav) = self.ensure_uav(envelope) {
                    uav.handle_autopilot_version(message)?;
                }
                Ok(())
            }
            Ardupilotmega::Data16(message) => self.on_data16(message, envelope),
            Ardupilotmega::Statustext(message) => self.on_statustext(message, envelope),
            Ardupilotmega::Timesync(message) => self.on_timesync(message),

            // Digested elsewhere or intentionally ignored.
            Ardupilotmega::CommandAck(_)
            | Ardupilotmega::ParamValue(_)
            | Ardupilotmega::MissionAck(_)
            | Ardupilotmega::MissionCount(_)
            | Ardupilotmega::MissionCurrent(_)
            | Ardupilotmega::MissionItemInt(_)
            | Ardupilotmega::MissionRequest(_)
            | Ardupilotmega::GpsGlobalOrigin(_)
            | Ardupilotmega::HomePosition(_)
            | Ardupilotmega::Hwstatus(_)
            | Ardupilotmega::LocalPositionNed(_)
            | Ardupilotmega::Meminfo(_)
            | Ardupilotmega::NavControllerOutput(_)
            | Ardupilotmega::PositionTargetGlobalInt(_)
            | Ardupilotmega::PowerStatus(_)
            | Ardupilotmega::FileTransferProtocol(_) => Ok(()),

            other => {
                self.warn_unhandled(envelope, other);
                Ok(())
            }
        }
    }

    fn on_data16(&self, message: &Data16, envelope: &IncomingEnvelope) -> Result<()> {
        if message.type_ == DRONE_SHOW_STATUS_TYPE {
            if let Some(uav) = self.ensure_uav(envelope) {
                uav.handle_drone_show_status(message)?;
            }
        }
        Ok(())
    }

    fn on_statustext(&self, message: &Statustext, envelope: &IncomingEnvelope) -> Result<()> {
        let text = decode_text(&message.text);
        if let Some(reason) = text.strip_prefix("PreArm: ") {
            if let Some(uav) = self.ensure_uav(envelope) {
                uav.notify_prearm_failure(reason)?;
            }
        } else if !text.is_empty() {
            log::log!(
                log_level_from_severity(message.severity),
                "[{}:{}] {text}",
                self.network_id,
                envelope.message.system_id()
            );
        }
        Ok(())
    }

    fn on_timesync(&self, message: &Timesync) -> Result<()> {
        if message.tc1 != 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as i64;
            log::info!(
                "[{}] Roundtrip time: {} msec",
                self.network_id,
                roundtrip_millis(message.ts1, now)
            );
        }
        Ok(())
    }

    fn ensure_uav(
        &self,
        envelope: &IncomingEnvelope,
    ) -> Option<Arc<dyn crate::network::uav::UavHandler>> {
        self.uavs
            .ensure(envelope.message.system_id(), envelope.address)
    }

    fn warn_unhandled(&self, envelope: &IncomingEnvelope, message: &Ardupilotmega) {
        use mavio::protocol::MessageSpec;

        let message_id = message.id();
        let first_time = self
            .unhandled
            .lock()
            .expect("poisoned unhandled set")
            .insert(message_id);
        if first_time {
            log::warn!(
                "[{}:{}] Unhandled MAVLink message type: {}",
                self.network_id,
                envelope.message.system_id(),
                message_name(message_id)
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn warned_types(&self) -> usize {
        self.unhandled.lock().expect("poisoned unhandled set").len()
    }
}

/// `true` for heartbeat sender types that denote an actual vehicle rather
/// than ground infrastructure.
fn is_vehicle(mav_type: MavType) -> bool {
    !matches!(
        mav_type,
        MavType::Gcs
            | MavType::AntennaTracker
            | MavType::Gimbal
            | MavType::Adsb
            | MavType::Camera
            | MavType::OnboardController
            | MavType::Gps
            | MavType::Battery
            | MavType::ChargingStation
            | MavType::Flarm
            | MavType::Servo
            | MavType::Odid
            | MavType::Imu
            | MavType::Log
            | MavType::Osd
            | MavType::Parachute
            | MavType::Winch
    )
}

fn log_level_from_severity(severity: MavSeverity) -> log::Level {
    match severity {
        MavSeverity::Emergency
        | MavSeverity::Alert
        | MavSeverity::Critical
        | MavSeverity::Error => log::Level::Error,
        MavSeverity::Warning => log::Level::Warn,
        MavSeverity::Notice | MavSeverity::Info => log::Level::Info,
        _ => log::Level::Debug,
    }
}

fn roundtrip_millis(ts1_us: i64, now_us: i64) -> i64 {
    (now_us - ts1_us) / 1000
}
