/*! # Mavnet

A MAVLink network multiplexer for drone fleets.

Mavnet manages sets of MAVLink transport connections that share one logical
namespace of vehicles: a [`MavLinkNetwork`](network::MavLinkNetwork) merges
the traffic of all of its connections, discovers drones from the wire,
dispatches their telemetry into application-provided handlers, correlates
commands with their replies, keeps the fleet alive with periodic heartbeats
and fans RTK correction data out both to the drones and to auxiliary
consumers over TCP.

The library is built on [Mavio](https://crates.io/crates/mavio) for MAVLink
framing and on [Tokio](https://tokio.rs/) for asynchronous I/O.

# Usage

```rust,no_run
# #[tokio::main(flavor = "current_thread")] async fn main() -> mavnet::error::Result<()> {
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mavnet::prelude::*;

# struct MyDriver;
# impl Driver for MyDriver {
#     fn create_uav(&self, _: &str) -> Arc<dyn UavHandler> { unimplemented!() }
# }
# struct MyRegistry;
# impl UavRegistry for MyRegistry {
#     fn register_uav(&self, _: &Arc<dyn UavHandler>) -> Result<()> { Ok(()) }
# }
// Networks are usually loaded from the server configuration
let spec: NetworkSpecification = serde_json::from_str(
    r#"{"id": "default", "connections": ["udp://0.0.0.0:14550"]}"#,
)?;

let network = Arc::new(MavLinkNetwork::from_specification(&spec)?);
let deps = NetworkDeps::new(Arc::new(MyDriver), Arc::new(MyRegistry));

// Run until cancelled; discovered drones show up in the registry
network.run(deps, CancellationToken::new()).await
# }
```

While a network runs, its send API is available from any task:

```rust,no_run
# async fn example(network: &mavnet::network::MavLinkNetwork) -> mavnet::error::Result<()> {
use mavnet::prelude::*;
use mavnet::protocol::dialect::enums::MavCmd;
use mavnet::protocol::dialect::messages::CommandLong;
use mavnet::protocol::dialect::Ardupilotmega;

let spec = MessageSpec::new(Ardupilotmega::CommandLong(CommandLong {
    command: MavCmd::ComponentArmDisarm,
    param1: 1.0,
    ..Default::default()
}));

let ack = network
    .send_packet_and_wait(
        spec,
        7,
        ResponseMatch::matching(
            77,
            FrameMatcher::field("command", MavCmd::ComponentArmDisarm as u32),
        ),
    )
    .await?;
# let _ = ack; Ok(())
# }
```
*/
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod comm;
pub mod consts;
pub mod error;
pub mod io;
pub mod network;
pub mod prelude;
pub mod protocol;
pub mod rtk;
pub mod sidekick;
pub mod signals;
pub mod utils;
