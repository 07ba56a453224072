use opencan_common::NodeId;

use crate::{
    bus::FrameBus,
    config::ClientConfig,
    nmt_master::NmtMaster,
    object_dict::{Object, ObjectDictionary, ObjectError, Variable},
    pdo::{PdoError, PdoNode},
    sdo_client::SdoClient,
};

/// One device on the bus
///
/// Holds the node's own copy of its object dictionary, with every variable attached to the node's
/// SDO client, along with the node's PDOs and NMT master.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    dictionary: ObjectDictionary,
    sdo: SdoClient,
    pdo: PdoNode,
    nmt: NmtMaster,
}

impl Node {
    /// Create a node from a shared dictionary schema
    ///
    /// The schema is copied, so changes made through this node never affect other nodes built
    /// from the same schema.
    pub fn new(id: NodeId, bus: &FrameBus, schema: &ObjectDictionary, config: &ClientConfig) -> Self {
        let sdo = SdoClient::with_settings(id, bus.clone(), config.sdo);
        let mut dictionary = schema.clone();
        dictionary.attach_sdo(&sdo);
        let pdo = PdoNode::new(&dictionary, &sdo, bus, config.pdo);
        let nmt = NmtMaster::with_settings(id.raw(), bus.clone(), config.nmt);
        log::info!(
            "Node {} attached with {} objects, {} RPDOs, {} TPDOs",
            id,
            dictionary.len(),
            pdo.rx().len(),
            pdo.tx().len()
        );
        Self {
            id,
            dictionary,
            sdo,
            pdo,
            nmt,
        }
    }

    /// The node ID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's object dictionary
    pub fn dictionary(&self) -> &ObjectDictionary {
        &self.dictionary
    }

    /// The node's object dictionary, mutably
    pub fn dictionary_mut(&mut self) -> &mut ObjectDictionary {
        &mut self.dictionary
    }

    /// The node's SDO client
    pub fn sdo(&self) -> &SdoClient {
        &self.sdo
    }

    /// The node's PDOs
    pub fn pdo(&self) -> &PdoNode {
        &self.pdo
    }

    /// The node's PDOs, mutably
    pub fn pdo_mut(&mut self) -> &mut PdoNode {
        &mut self.pdo
    }

    /// The node's NMT master
    pub fn nmt(&self) -> &NmtMaster {
        &self.nmt
    }

    /// The node's NMT master, mutably
    pub fn nmt_mut(&mut self) -> &mut NmtMaster {
        &mut self.nmt
    }

    /// Get an object by index
    pub fn find_index(&self, index: u16) -> Result<&Object, ObjectError> {
        self.dictionary.find_index(index)
    }

    /// Get an object by name
    pub fn find_name(&self, name: &str) -> Result<&Object, ObjectError> {
        self.dictionary.find_name(name)
    }

    /// Get the locally held copy of a variable
    pub fn variable(&self, index: u16, sub: u8) -> Result<&Variable, ObjectError> {
        self.dictionary.variable(index, sub)
    }

    /// Read a variable from the device, updating the local copy
    pub async fn read(&mut self, index: u16, sub: u8) -> Result<Vec<u8>, ObjectError> {
        let var = self.dictionary.variable_mut(index, sub)?;
        Ok(var.read().await?.to_vec())
    }

    /// Write a variable on the device, updating the local copy
    pub async fn write(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), ObjectError> {
        self.dictionary.variable_mut(index, sub)?.write(data).await
    }

    /// Read the layout of every PDO from the device, and start listening for them
    pub async fn read_pdos(&mut self) -> Result<(), PdoError> {
        self.pdo.read(&mut self.dictionary).await
    }

    /// Stop the node's PDO and heartbeat listeners
    pub fn stop(&mut self) {
        self.pdo.unlisten();
        if self.nmt.is_listening() {
            // Cannot fail while listening
            let _ = self.nmt.unlisten_for_heartbeat();
        }
    }
}
