//! Process data objects
//!
//! A [PdoMap] derives the byte layout of one PDO from the node's communication and mapping
//! parameters, then listens on the bus for the PDO's COB-ID and keeps the latest data. A
//! [PdoMapSet] holds all PDOs of one direction, and a [PdoNode] holds both directions of a node.
use opencan_common::constants::object_ids::{
    RPDO_COMM_BASE, RPDO_MAP_BASE, TPDO_COMM_BASE, TPDO_MAP_BASE,
};
use snafu::{OptionExt, Snafu};

mod map;
mod map_set;

pub use map::{ChangeSubscription, PdoMap};
pub use map_set::PdoMapSet;

use crate::{
    bus::FrameBus, config::PdoSettings, object_dict::ObjectError, sdo_client::SdoClientError,
    ObjectDictionary, SdoClient, Variable,
};

/// Errors returned by PDO operations
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PdoError {
    /// No mapped variable has the name
    #[snafu(display("No PDO maps a variable named '{name}'"))]
    NotFound {
        /// The name searched for
        name: String,
    },
    /// The mapping has not been read from the node yet
    #[snafu(display("PDO {number} must be read before listening"))]
    NotRead {
        /// PDO number
        number: u8,
    },
    /// Writing PDO configuration back to the node is not implemented
    #[snafu(display("Saving PDO configuration is not supported"))]
    SaveUnsupported,
    /// Reading a PDO parameter failed
    #[snafu(display("Failed reading PDO parameter {index:#06x}sub{sub}: {source}"))]
    Sdo {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Underlying error
        source: SdoClientError,
    },
    /// A mapped object could not be resolved in the object dictionary
    #[snafu(display("Object dictionary error: {source}"))]
    Object {
        /// Underlying error
        source: ObjectError,
    },
}

/// Decode a little endian unsigned value of up to 8 bytes
pub(crate) fn le_uint(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = data.len().min(8);
    bytes[..len].copy_from_slice(&data[..len]);
    u64::from_le_bytes(bytes)
}

/// The receive and transmit PDOs of one node
#[derive(Debug)]
pub struct PdoNode {
    rx: PdoMapSet,
    tx: PdoMapSet,
}

impl PdoNode {
    /// Find the PDOs described in `dict`
    ///
    /// RPDOs use communication parameters at 0x1400 and mappings at 0x1600; TPDOs use 0x1800 and
    /// 0x1A00.
    pub fn new(
        dict: &ObjectDictionary,
        sdo: &SdoClient,
        bus: &FrameBus,
        settings: PdoSettings,
    ) -> Self {
        Self {
            rx: PdoMapSet::new(dict, RPDO_COMM_BASE, RPDO_MAP_BASE, sdo, bus, settings),
            tx: PdoMapSet::new(dict, TPDO_COMM_BASE, TPDO_MAP_BASE, sdo, bus, settings),
        }
    }

    /// The receive PDOs
    pub fn rx(&self) -> &PdoMapSet {
        &self.rx
    }

    /// The receive PDOs, mutably
    pub fn rx_mut(&mut self) -> &mut PdoMapSet {
        &mut self.rx
    }

    /// The transmit PDOs
    pub fn tx(&self) -> &PdoMapSet {
        &self.tx
    }

    /// The transmit PDOs, mutably
    pub fn tx_mut(&mut self) -> &mut PdoMapSet {
        &mut self.tx
    }

    /// Read every PDO's layout from the node, and start listening
    ///
    /// Stops at the first failure.
    pub async fn read(&mut self, dict: &mut ObjectDictionary) -> Result<(), PdoError> {
        self.rx.read(dict).await?;
        self.tx.read(dict).await
    }

    /// Find the PDO mapping a variable, searching receive PDOs first
    pub fn find_by_name(&self, name: &str) -> Option<&PdoMap> {
        self.rx
            .find_by_name(name)
            .or_else(|| self.tx.find_by_name(name))
    }

    /// The current value of a mapped variable, taken from its PDO's latest data
    pub fn value(&self, name: &str) -> Result<Variable, PdoError> {
        self.find_by_name(name)
            .and_then(|map| map.value(name))
            .context(NotFoundSnafu { name })
    }

    /// Stop listening on every PDO
    pub fn unlisten(&mut self) {
        self.rx.unlisten();
        self.tx.unlisten();
    }

    /// Write PDO configuration back to the node. Not supported.
    pub async fn save(&self) -> Result<(), PdoError> {
        SaveUnsupportedSnafu.fail()
    }
}
