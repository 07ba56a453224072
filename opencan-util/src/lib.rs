//! Transport adapters for opencan
//!
//! Connects the [AsyncCanSender](opencan_common::traits::AsyncCanSender) and
//! [AsyncCanReceiver](opencan_common::traits::AsyncCanReceiver) traits to real CAN interfaces.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use self::socketcan::{open_socketcan, ReceiveError, SocketCanReceiver, SocketCanSender};
