use std::collections::HashMap;
use std::time::Duration;

use opencan_common::{
    constants::object_ids::DEVICE_TYPE,
    messages::{HEARTBEAT_ID, SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::SdoRequest,
    CanId, CanMessage, NodeId,
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    bus::{BusError, FrameBus},
    config::ClientConfig,
    nmt_master::{NmtError, NmtMaster},
    node::Node,
    object_dict::ObjectDictionary,
};

/// Function codes of the messages a node may send
const NODE_SERVICES: [u32; 7] = [
    HEARTBEAT_ID as u32,
    SDO_RESP_BASE as u32,
    0x180,
    0x280,
    0x380,
    0x480,
    0x80,
];

/// Errors returned by network operations
#[derive(Debug, Snafu)]
pub enum NetworkError {
    /// No node with the ID has been added
    #[snafu(display("No node with id {node_id}"))]
    NoSuchNode {
        /// The requested ID
        node_id: u8,
    },
    /// The node ID is out of range
    #[snafu(display("Invalid node id {node_id}"))]
    InvalidNodeId {
        /// The rejected ID
        node_id: u8,
    },
    /// A broadcast NMT operation failed
    #[snafu(display("NMT error: {source}"))]
    Nmt {
        /// Underlying error
        source: NmtError,
    },
    /// The bus failed
    #[snafu(display("Bus error: {source}"))]
    Bus {
        /// Underlying error
        source: BusError,
    },
}

/// A set of nodes sharing one bus
///
/// The network also holds a broadcast [NmtMaster], addressing node 0, for commands to all nodes.
#[derive(Debug)]
pub struct Network {
    bus: FrameBus,
    config: ClientConfig,
    nodes: HashMap<u8, Node>,
    nmt: NmtMaster,
}

impl Network {
    /// Create a network on a bus, with default configuration
    pub fn new(bus: FrameBus) -> Self {
        Self::with_config(bus, ClientConfig::default())
    }

    /// Create a network with explicit configuration
    pub fn with_config(bus: FrameBus, config: ClientConfig) -> Self {
        let nmt = NmtMaster::with_settings(0, bus.clone(), config.nmt);
        Self {
            bus,
            config,
            nodes: HashMap::new(),
            nmt,
        }
    }

    /// The bus shared by all nodes
    pub fn bus(&self) -> &FrameBus {
        &self.bus
    }

    /// The broadcast NMT master
    pub fn nmt(&self) -> &NmtMaster {
        &self.nmt
    }

    /// Start the bus read loop and the broadcast heartbeat listener
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&mut self) {
        self.bus.run();
        self.nmt.listen_for_heartbeat();
    }

    /// Stop every node's listeners, the broadcast heartbeat listener, and the bus read loop
    pub async fn stop(&mut self) {
        for node in self.nodes.values_mut() {
            node.stop();
        }
        if self.nmt.is_listening() {
            let _ = self.nmt.unlisten_for_heartbeat();
        }
        self.bus.stop().await;
    }

    /// Add a node, described by `schema`
    ///
    /// A node already registered with the same ID is stopped and replaced.
    pub fn add_node(
        &mut self,
        node_id: u8,
        schema: &ObjectDictionary,
    ) -> Result<&mut Node, NetworkError> {
        let id = NodeId::new(node_id).map_err(|_| InvalidNodeIdSnafu { node_id }.build())?;
        let node = Node::new(id, &self.bus, schema, &self.config);
        if let Some(mut old) = self.nodes.insert(node_id, node) {
            log::warn!("Replacing node {node_id}");
            old.stop();
        }
        self.node_mut(node_id)
    }

    /// Get a node by ID
    pub fn node(&self, node_id: u8) -> Result<&Node, NetworkError> {
        self.nodes.get(&node_id).context(NoSuchNodeSnafu { node_id })
    }

    /// Get a node by ID, mutably
    pub fn node_mut(&mut self, node_id: u8) -> Result<&mut Node, NetworkError> {
        self.nodes
            .get_mut(&node_id)
            .context(NoSuchNodeSnafu { node_id })
    }

    /// Stop and remove a node
    pub fn remove_node(&mut self, node_id: u8) -> Result<Node, NetworkError> {
        let mut node = self
            .nodes
            .remove(&node_id)
            .context(NoSuchNodeSnafu { node_id })?;
        node.stop();
        Ok(node)
    }

    /// Iterate over the nodes, in no particular order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Send an NMT command to every node, by name
    pub async fn set_state_all(&self, command: &str) -> Result<(), NetworkError> {
        self.nmt.set_state(command).await.context(NmtSnafu)
    }

    /// Find nodes present on the bus
    ///
    /// Sends an SDO read of the device type object to node IDs 0 to `limit + 1`, then collects for
    /// `timeout` the IDs of all nodes heard from, in the order they were first heard. Any message a
    /// node may send counts, not just SDO responses. The bus must be running.
    pub async fn search(&self, limit: u8, timeout: Duration) -> Result<Vec<u8>, NetworkError> {
        if !self.bus.is_running() {
            return Err(NetworkError::Bus {
                source: BusError::NotRunning,
            });
        }

        let mut subscription = self
            .bus
            .acquire_subscription(Some(Box::new(|msg: &CanMessage| {
                let id = msg.id();
                !id.is_extended()
                    && id.node_id() != 0
                    && NODE_SERVICES.contains(&id.function_code())
            })));

        let ping = SdoRequest::initiate_upload(DEVICE_TYPE, 0).to_bytes();
        let last = (limit as u16 + 1).min(NodeId::MAX as u16);
        for i in 0..=last {
            self.bus
                .send(CanId::std(SDO_REQ_BASE + i), &ping)
                .await
                .context(BusSnafu)?;
        }

        let mut found = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, subscription.recv()).await {
            let node_id = msg.id().node_id();
            if !found.contains(&node_id) {
                log::debug!("Found node {node_id}");
                found.push(node_id);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_bus;

    #[tokio::test]
    async fn test_node_registry() {
        let (bus, _handle) = mock_bus();
        let mut network = Network::new(bus);
        let schema = ObjectDictionary::new();

        assert!(matches!(
            network.add_node(0, &schema),
            Err(NetworkError::InvalidNodeId { node_id: 0 })
        ));
        assert!(matches!(
            network.add_node(128, &schema),
            Err(NetworkError::InvalidNodeId { node_id: 128 })
        ));

        network.add_node(5, &schema).unwrap();
        assert_eq!(5, network.node(5).unwrap().id().raw());
        assert!(matches!(
            network.node(6),
            Err(NetworkError::NoSuchNode { node_id: 6 })
        ));

        network.remove_node(5).unwrap();
        assert!(network.node(5).is_err());
        assert!(network.remove_node(5).is_err());
    }

    #[tokio::test]
    async fn test_search_requires_running_bus() {
        let (bus, handle) = mock_bus();
        let network = Network::new(bus);
        assert!(matches!(
            network.search(10, Duration::from_millis(10)).await,
            Err(NetworkError::Bus {
                source: BusError::NotRunning
            })
        ));
        assert!(handle.sent().is_empty());
    }

    #[tokio::test]
    async fn test_search_pings() {
        let (bus, handle) = mock_bus();
        let mut network = Network::new(bus);
        network.run();

        let responder = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for id in [0x583u16, 0x703, 0x182, 0x600, 0x580, 0x583] {
                responder.inject(CanMessage::new(CanId::std(id), &[0]));
            }
        });

        let found = network.search(4, Duration::from_millis(100)).await.unwrap();
        assert_eq!(vec![3, 2], found);

        let sent = handle.sent();
        assert_eq!(6, sent.len());
        assert_eq!(CanId::std(0x605), sent[5].id());
        assert_eq!(&[0x40, 0x00, 0x10, 0, 0, 0, 0, 0], sent[5].data());
    }
}
