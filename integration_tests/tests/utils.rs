#![allow(dead_code)]
use integration_tests::sim_bus::SimBus;
use opencan_client::FrameBus;
use opencan_common::{
    messages::{Heartbeat, NmtCommand},
    sdo::{SdoRequest, SdoResponse},
    CanMessage, NodeId,
};

/// Connect a running client bus to a new simulated bus
pub fn setup() -> (SimBus, FrameBus) {
    let sim = SimBus::new();
    let (sender, receiver) = sim.new_pair();
    let bus = FrameBus::new(sender, receiver);
    bus.run();
    (sim, bus)
}

pub fn node_id(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

/// Prints the bus history when dropped, to help diagnose failing tests
pub struct BusLogger {
    sim: SimBus,
}

impl BusLogger {
    pub fn new(sim: &SimBus) -> Self {
        Self { sim: sim.clone() }
    }

    fn describe(msg: &CanMessage) -> String {
        let function = msg.id().function_code();
        if let Ok(cmd) = NmtCommand::try_from(*msg) {
            format!("{cmd:?}")
        } else if let Ok(hb) = Heartbeat::try_from(*msg) {
            format!("{hb:?}")
        } else if function == 0x600 {
            match SdoRequest::try_from(msg.data()) {
                Ok(req) => format!("{} {req:?}", msg.id()),
                Err(_) => format!("{msg:?}"),
            }
        } else if function == 0x580 {
            match SdoResponse::try_from(*msg) {
                Ok(resp) => format!("{} {resp:?}", msg.id()),
                Err(_) => format!("{msg:?}"),
            }
        } else {
            format!("{msg:?}")
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        for msg in self.sim.history() {
            println!("{}", Self::describe(&msg));
        }
    }
}
