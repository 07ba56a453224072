//! Common functionality shared among other opencan crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `opencan-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use node_id::NodeId;

pub use messages::{CanId, CanMessage};
