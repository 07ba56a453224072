//! A client for communicating with CANopen nodes
//!
//! The crate provides the protocol engine of a CANopen master, including:
//!
//! - A [FrameBus] which owns the CAN transport and fans received frames out to any number of
//!   filtered subscribers
//! - An [object dictionary](ObjectDictionary) model built from [Variable], array and record
//!   entries
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary via its SDO server
//! - [PDO maps](PdoMap) which derive their layout from the node's mapping parameters and track live
//!   process data
//! - An [NMT master](NmtMaster) which tracks node state via heartbeats and sends NMT commands
//! - A [Node] tying the above together for one device, and a [Network] managing many nodes on one
//!   bus
//!
//! This library is based on tokio/async.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bus;
mod config;
mod network;
pub mod nmt_master;
mod node;
pub mod object_dict;
pub mod pdo;
mod sdo_client;

#[cfg(test)]
mod test_utils;

pub use opencan_common as common;

pub use bus::{BusError, FrameBus, FrameFilter, Subscription, SubscriptionId};
pub use config::{BusSettings, ClientConfig, ConfigError, NmtSettings, PdoSettings, SdoSettings};
pub use network::{Network, NetworkError};
pub use nmt_master::{NmtError, NmtMaster};
pub use node::Node;
pub use object_dict::{Composite, Object, ObjectDictionary, ObjectError, Variable};
pub use pdo::{PdoError, PdoMap, PdoMapSet, PdoNode};
pub use sdo_client::{ResponseMatcher, SdoClient, SdoClientError};
