use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mavio::protocol::MavLinkVersion;

use crate::network::conf::IdFormat;
use crate::protocol::dialect::messages::{
    AutopilotVersion, Data16, GlobalPositionInt, GpsRawInt, Heartbeat, SysStatus,
};
use crate::protocol::SystemId;

use crate::prelude::*;

/// Per-vehicle state handler.
///
/// The network creates one handler per system `ID` on first sighting and
/// forwards digested messages to it. Handler errors are logged at the
/// dispatch boundary and never propagate into the network.
pub trait UavHandler: Send + Sync {
    /// Binds the handler to the network and system `ID` it was discovered
    /// on. Called exactly once, before the handler is registered anywhere.
    fn assign_to_network(&self, network_id: &str, system_id: SystemId);

    /// MAVLink version the vehicle is known to speak.
    fn mavlink_version(&self) -> MavLinkVersion {
        MavLinkVersion::V2
    }

    /// Handles an incoming heartbeat of a vehicle type.
    fn handle_heartbeat(&self, _message: &Heartbeat) -> Result<()> {
        Ok(())
    }

    /// Handles a system status report.
    fn handle_sys_status(&self, _message: &SysStatus) -> Result<()> {
        Ok(())
    }

    /// Handles a GPS fix report.
    fn handle_gps_raw_int(&self, _message: &GpsRawInt) -> Result<()> {
        Ok(())
    }

    /// Handles a fused global position report.
    fn handle_global_position_int(&self, _message: &GlobalPositionInt) -> Result<()> {
        Ok(())
    }

    /// Handles an autopilot version and capability report.
    fn handle_autopilot_version(&self, _message: &AutopilotVersion) -> Result<()> {
        Ok(())
    }

    /// Handles a drone show status report carried in a `DATA16` packet.
    fn handle_drone_show_status(&self, _message: &Data16) -> Result<()> {
        Ok(())
    }

    /// Notifies the vehicle state about a pre-arm check failure.
    fn notify_prearm_failure(&self, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// Factory for per-vehicle handlers, supplied by the application's driver
/// layer.
pub trait Driver: Send + Sync {
    /// Creates the handler for a newly discovered drone.
    fn create_uav(&self, uav_id: &str) -> Arc<dyn UavHandler>;
}

/// Application-side UAV registry; registration is idempotent.
pub trait UavRegistry: Send + Sync {
    /// Registers a newly discovered UAV with the application.
    fn register_uav(&self, uav: &Arc<dyn UavHandler>) -> Result<()>;
}

struct DirectoryState {
    uavs: HashMap<SystemId, Arc<dyn UavHandler>>,
    addresses: HashMap<SystemId, SocketAddr>,
}

/// The mapping from system `ID`s to UAV handlers and their last-known
/// addresses, populated lazily on first sighting.
pub(crate) struct UavDirectory {
    network_id: String,
    id_format: IdFormat,
    driver: Arc<dyn Driver>,
    registry: Arc<dyn UavRegistry>,
    state: Mutex<DirectoryState>,
}

impl UavDirectory {
    pub(crate) fn new(
        network_id: String,
        id_format: IdFormat,
        driver: Arc<dyn Driver>,
        registry: Arc<dyn UavRegistry>,
    ) -> Self {
        Self {
            network_id,
            id_format,
            driver,
            registry,
            state: Mutex::new(DirectoryState {
                uavs: HashMap::new(),
                addresses: HashMap::new(),
            }),
        }
    }

    /// Returns the handler for the given system `ID`, creating and
    /// registering it on first sighting, and records the peer address the
    /// vehicle was last heard from.
    ///
    /// System `ID` 0 denotes a broadcast source and never maps to a UAV.
    pub(crate) fn ensure(
        &self,
        system_id: SystemId,
        address: SocketAddr,
    ) -> Option<Arc<dyn UavHandler>> {
        if system_id == 0 {
            return None;
        }

        let mut state = self.state.lock().expect("poisoned UAV directory");

        let uav = match state.uavs.get(&system_id) {
            Some(uav) => uav.clone(),
            None => {
                let uav_id = self.id_format.format(system_id, &self.network_id);
                let uav = self.driver.create_uav(&uav_id);
                uav.assign_to_network(&self.network_id, system_id);
                if let Err(err) = self.registry.register_uav(&uav) {
                    log::error!(
                        "[{}] can't register UAV {uav_id} ({err}); keeping it locally",
                        self.network_id
                    );
                }
                state.uavs.insert(system_id, uav.clone());
                uav
            }
        };

        // TODO: protect from address hijacking; for now the last sighting
        // wins.
        state.addresses.insert(system_id, address);

        Some(uav)
    }

    /// Returns the handler of an already known UAV.
    pub(crate) fn get(&self, system_id: SystemId) -> Option<Arc<dyn UavHandler>> {
        self.state
            .lock()
            .expect("poisoned UAV directory")
            .uavs
            .get(&system_id)
            .cloned()
    }

    /// Last-known address of a UAV.
    pub(crate) fn address_of(&self, system_id: SystemId) -> Option<SocketAddr> {
        self.state
            .lock()
            .expect("poisoned UAV directory")
            .addresses
            .get(&system_id)
            .copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("poisoned UAV directory").uavs.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every call a network makes into the driver layer.
    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub(crate) created: Mutex<Vec<String>>,
        pub(crate) uavs: Mutex<Vec<Arc<FakeUav>>>,
    }

    impl FakeDriver {
        /// The `index`-th handler this driver has produced.
        pub(crate) fn uav(&self, index: usize) -> Arc<FakeUav> {
            self.uavs.lock().unwrap()[index].clone()
        }
    }

    impl Driver for Arc<FakeDriver> {
        fn create_uav(&self, uav_id: &str) -> Arc<dyn UavHandler> {
            self.created.lock().unwrap().push(uav_id.to_string());
            let uav = Arc::new(FakeUav::default());
            self.uavs.lock().unwrap().push(uav.clone());
            uav
        }
    }

    /// Handler fake that counts the messages forwarded to it.
    #[derive(Default)]
    pub(crate) struct FakeUav {
        pub(crate) assigned: Mutex<Option<(String, SystemId)>>,
        pub(crate) heartbeats: AtomicUsize,
        pub(crate) positions: AtomicUsize,
        pub(crate) show_statuses: AtomicUsize,
        pub(crate) prearm_failures: Mutex<Vec<String>>,
    }

    impl UavHandler for FakeUav {
        fn assign_to_network(&self, network_id: &str, system_id: SystemId) {
            *self.assigned.lock().unwrap() = Some((network_id.to_string(), system_id));
        }

        fn handle_heartbeat(&self, _message: &Heartbeat) -> Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_global_position_int(&self, _message: &GlobalPositionInt) -> Result<()> {
            self.positions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_drone_show_status(&self, _message: &Data16) -> Result<()> {
            self.show_statuses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn notify_prearm_failure(&self, reason: &str) -> Result<()> {
            self.prearm_failures.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    /// Registry fake counting registrations per UAV identity.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub(crate) registered: AtomicUsize,
    }

    impl UavRegistry for Arc<FakeRegistry> {
        fn register_uav(&self, _uav: &Arc<dyn UavHandler>) -> Result<()> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod uav_tests {
    use super::test_support::*;
    use super::*;

    fn directory(driver: Arc<FakeDriver>, registry: Arc<FakeRegistry>) -> UavDirectory {
        UavDirectory::new(
            "alpha".to_string(),
            IdFormat::new("DRN-{0}-{1}"),
            Arc::new(driver),
            Arc::new(registry),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn uav_is_created_once_and_registered_once() {
        let driver = Arc::new(FakeDriver::default());
        let registry = Arc::new(FakeRegistry::default());
        let directory = directory(driver.clone(), registry.clone());

        let first = directory.ensure(7, addr(1000)).unwrap();
        let second = directory.ensure(7, addr(1001)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directory.len(), 1);
        assert_eq!(
            driver.created.lock().unwrap().as_slice(),
            &["DRN-7-alpha".to_string()]
        );
        assert_eq!(
            registry.registered.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn address_updates_are_last_write_wins() {
        let directory = directory(
            Arc::new(FakeDriver::default()),
            Arc::new(FakeRegistry::default()),
        );

        directory.ensure(7, addr(1000));
        assert_eq!(directory.address_of(7), Some(addr(1000)));

        directory.ensure(7, addr(1001));
        assert_eq!(directory.address_of(7), Some(addr(1001)));
    }

    #[test]
    fn broadcast_source_never_becomes_a_uav() {
        let directory = directory(
            Arc::new(FakeDriver::default()),
            Arc::new(FakeRegistry::default()),
        );

        assert!(directory.ensure(0, addr(1000)).is_none());
        assert_eq!(directory.len(), 0);
        assert_eq!(directory.address_of(0), None);
    }
}
