//! Heartbeat tracking and NMT commands for one node
//!
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencan_common::{
    messages::{Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState},
    CanMessage,
};
use snafu::{ResultExt, Snafu};
use tokio::{task::JoinHandle, time::Instant};

use crate::bus::{BusError, FrameBus};
use crate::config::NmtSettings;

/// Errors returned by the NMT master
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum NmtError {
    /// The command name is not recognized
    #[snafu(display("Invalid NMT command: '{command}'"))]
    InvalidCommand {
        /// The rejected name
        command: String,
    },
    /// The heartbeat listener is not running
    #[snafu(display("Not listening for heartbeats"))]
    NotListening,
    /// The node did not report the expected state in time
    #[snafu(display("Timed out after {timeout:?} waiting for node to become operational"))]
    Timeout {
        /// How long was waited
        timeout: Duration,
    },
    /// The command could not be sent
    #[snafu(display("Bus error: {source}"))]
    Bus {
        /// Underlying error
        source: BusError,
    },
}

#[derive(Debug, Default)]
struct HeartbeatStatus {
    state: NmtState,
    state_received: bool,
    timestamp: Option<Instant>,
}

/// Sends NMT commands to a node, and tracks the state it reports in its heartbeat
///
/// A master for node 0 addresses every node with its commands. Its heartbeat listener only
/// follows ID 0x700, which no node produces.
#[derive(Debug)]
pub struct NmtMaster {
    node_id: u8,
    bus: FrameBus,
    settings: NmtSettings,
    status: Arc<Mutex<HeartbeatStatus>>,
    listener: Option<JoinHandle<()>>,
}

impl NmtMaster {
    /// Create a master for a node, using default timing
    pub fn new(node_id: u8, bus: FrameBus) -> Self {
        Self::with_settings(node_id, bus, NmtSettings::default())
    }

    /// Create a master with explicit timing
    pub fn with_settings(node_id: u8, bus: FrameBus, settings: NmtSettings) -> Self {
        Self {
            node_id,
            bus,
            settings,
            status: Arc::new(Mutex::new(HeartbeatStatus::default())),
            listener: None,
        }
    }

    /// The node ID this master addresses
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Start tracking the node's heartbeat
    ///
    /// Does nothing if already listening.
    pub fn listen_for_heartbeat(&mut self) {
        if self.is_listening() {
            return;
        }
        let cob_id = Heartbeat::cob_id(self.node_id);
        let mut subscription = self
            .bus
            .acquire_subscription(Some(Box::new(move |msg: &CanMessage| msg.id() == cob_id)));
        let status = self.status.clone();
        self.listener = Some(tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                let heartbeat = match Heartbeat::try_from(msg) {
                    Ok(hb) => hb,
                    Err(e) => {
                        log::warn!("Ignoring heartbeat {:?}: {e}", msg);
                        continue;
                    }
                };
                // A bootup message means the node has entered pre-operational
                let state = match heartbeat.state {
                    NmtState::Initialising => NmtState::PreOperational,
                    state => state,
                };
                let mut status = status.lock().unwrap();
                status.state = state;
                status.state_received = true;
                status.timestamp = Some(Instant::now());
            }
        }));
    }

    /// Stop tracking the node's heartbeat
    pub fn unlisten_for_heartbeat(&mut self) -> Result<(), NmtError> {
        match self.listener.take() {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => NotListeningSnafu.fail(),
        }
    }

    /// True while the heartbeat listener is running
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Command the node into a state, by name
    ///
    /// Accepts OPERATIONAL, STOPPED, SLEEP, STANDBY, PRE-OPERATIONAL, INITIALISING, RESET and
    /// RESET COMMUNICATION. The last received state is cleared before the command is sent.
    pub async fn set_state(&self, command: &str) -> Result<(), NmtError> {
        let cs: NmtCommandSpecifier = command
            .parse()
            .map_err(|_| InvalidCommandSnafu { command }.build())?;
        self.status.lock().unwrap().state_received = false;
        self.send_command(cs).await
    }

    /// Send an NMT command to the node
    pub async fn send_command(&self, cs: NmtCommandSpecifier) -> Result<(), NmtError> {
        log::info!("Sending NMT {:?} to node {}", cs, self.node_id);
        let msg: CanMessage = NmtCommand {
            cs,
            node: self.node_id,
        }
        .into();
        self.bus.send_message(msg).await.context(BusSnafu)
    }

    /// Wait for the node to report the operational state
    ///
    /// Polls the heartbeat state until it is operational or `timeout` (or the configured default)
    /// expires. Requires the heartbeat listener to be running to succeed.
    pub async fn wait_for_bootup(&self, timeout: Option<Duration>) -> Result<(), NmtError> {
        let timeout = timeout.unwrap_or(self.settings.bootup_timeout());
        let deadline = Instant::now() + timeout;
        loop {
            {
                let status = self.status.lock().unwrap();
                if status.state_received && status.state == NmtState::Operational {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return TimeoutSnafu { timeout }.fail();
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// The most recently reported state
    pub fn state(&self) -> NmtState {
        self.status.lock().unwrap().state
    }

    /// True if a state has been received since the last command
    pub fn state_received(&self) -> bool {
        self.status.lock().unwrap().state_received
    }

    /// The most recently reported state, by name
    pub fn state_string(&self) -> String {
        self.state().to_string()
    }

    /// When the last heartbeat was received
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.status.lock().unwrap().timestamp
    }
}

impl Drop for NmtMaster {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use opencan_common::CanId;

    use super::*;
    use crate::test_utils::mock_bus;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_set_state_sends_command() {
        let (bus, handle) = mock_bus();
        let nmt = NmtMaster::new(4, bus);

        nmt.set_state("OPERATIONAL").await.unwrap();
        nmt.set_state("RESET COMMUNICATION").await.unwrap();

        let sent = handle.sent();
        assert_eq!(CanId::std(0), sent[0].id());
        assert_eq!(&[0x01, 4], sent[0].data());
        assert_eq!(&[130, 4], sent[1].data());
    }

    #[tokio::test]
    async fn test_invalid_command() {
        let (bus, handle) = mock_bus();
        let nmt = NmtMaster::new(4, bus);
        assert_eq!(
            Err(NmtError::InvalidCommand {
                command: "JUMP".into()
            }),
            nmt.set_state("JUMP").await
        );
        assert!(handle.sent().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_states() {
        let (bus, handle) = mock_bus();
        bus.run();
        let mut nmt = NmtMaster::new(7, bus);
        nmt.listen_for_heartbeat();
        nmt.listen_for_heartbeat();
        assert!(nmt.is_listening());
        assert!(nmt.last_heartbeat().is_none());

        handle.inject(CanMessage::new(CanId::std(0x707), &[0x05]));
        settle().await;
        assert_eq!(NmtState::Operational, nmt.state());
        assert_eq!("OPERATIONAL", nmt.state_string());
        assert!(nmt.last_heartbeat().is_some());

        handle.inject(CanMessage::new(CanId::std(0x707), &[0x00]));
        settle().await;
        assert_eq!(NmtState::PreOperational, nmt.state());

        // Other nodes' heartbeats are not ours
        handle.inject(CanMessage::new(CanId::std(0x708), &[0x04]));
        settle().await;
        assert_eq!(NmtState::PreOperational, nmt.state());
    }

    #[tokio::test]
    async fn test_broadcast_master_ignores_node_heartbeats() {
        let (bus, handle) = mock_bus();
        bus.run();
        let mut nmt = NmtMaster::new(0, bus);
        nmt.listen_for_heartbeat();

        handle.inject(CanMessage::new(CanId::std(0x705), &[0x05]));
        settle().await;
        assert!(!nmt.state_received());
        assert!(nmt.last_heartbeat().is_none());
        assert_eq!(NmtState::default(), nmt.state());
    }

    #[tokio::test]
    async fn test_unlisten() {
        let (bus, _handle) = mock_bus();
        let mut nmt = NmtMaster::new(7, bus.clone());
        assert_eq!(Err(NmtError::NotListening), nmt.unlisten_for_heartbeat());

        nmt.listen_for_heartbeat();
        assert_eq!(1, bus.subscription_count());
        nmt.unlisten_for_heartbeat().unwrap();
        assert!(!nmt.is_listening());
        settle().await;
        assert_eq!(0, bus.subscription_count());
    }

    #[tokio::test]
    async fn test_wait_for_bootup() {
        let (bus, handle) = mock_bus();
        bus.run();
        let mut nmt = NmtMaster::new(3, bus);
        nmt.listen_for_heartbeat();

        assert!(matches!(
            nmt.wait_for_bootup(Some(Duration::from_millis(150))).await,
            Err(NmtError::Timeout { .. })
        ));

        let injector = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            injector.inject(CanMessage::new(CanId::std(0x703), &[0x05]));
        });
        nmt.wait_for_bootup(Some(Duration::from_secs(1))).await.unwrap();

        nmt.set_state("STOPPED").await.unwrap();
        assert!(!nmt.state_received());
    }
}
