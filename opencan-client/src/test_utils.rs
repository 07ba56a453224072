//! In-memory CAN transport for unit tests
use std::sync::{Arc, Mutex};

use opencan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{config::BusSettings, FrameBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockReceiveError;

impl core::fmt::Display for MockReceiveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "mock receive error")
    }
}

impl std::error::Error for MockReceiveError {}

/// Records every frame sent, and optionally forwards it to a responder
pub struct MockSender {
    sent: Arc<Mutex<Vec<CanMessage>>>,
    echo: Option<UnboundedSender<CanMessage>>,
}

impl AsyncCanSender for MockSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.sent.lock().unwrap().push(msg);
        if let Some(echo) = &self.echo {
            let _ = echo.send(msg);
        }
        Ok(())
    }
}

pub struct MockReceiver {
    rx: UnboundedReceiver<Result<CanMessage, MockReceiveError>>,
}

impl AsyncCanReceiver for MockReceiver {
    type Error = MockReceiveError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        match self.rx.try_recv() {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        match self.rx.recv().await {
            Some(result) => result,
            // All handles dropped; nothing will ever arrive
            None => std::future::pending().await,
        }
    }
}

/// Test side of a mock bus
#[derive(Clone)]
pub struct MockBusHandle {
    sent: Arc<Mutex<Vec<CanMessage>>>,
    inject: UnboundedSender<Result<CanMessage, MockReceiveError>>,
}

impl MockBusHandle {
    /// Deliver a frame as if it were received from the bus
    pub fn inject(&self, msg: CanMessage) {
        self.inject.send(Ok(msg)).unwrap();
    }

    /// Make the next read fail
    pub fn inject_error(&self, err: MockReceiveError) {
        self.inject.send(Err(err)).unwrap();
    }

    /// All frames sent so far
    pub fn sent(&self) -> Vec<CanMessage> {
        self.sent.lock().unwrap().clone()
    }
}

pub fn mock_bus() -> (FrameBus, MockBusHandle) {
    mock_bus_with_settings(BusSettings::default())
}

pub fn mock_bus_with_settings(settings: BusSettings) -> (FrameBus, MockBusHandle) {
    let (bus, handle, _) = build(settings, false);
    (bus, handle)
}

/// A mock bus which also forwards every sent frame on a channel, so a test can play the part of
/// a remote device
pub fn mock_bus_with_responder() -> (FrameBus, MockBusHandle, UnboundedReceiver<CanMessage>) {
    let (bus, handle, echo) = build(BusSettings::default(), true);
    (bus, handle, echo.unwrap())
}

fn build(
    settings: BusSettings,
    with_echo: bool,
) -> (FrameBus, MockBusHandle, Option<UnboundedReceiver<CanMessage>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let (inject, rx) = unbounded_channel();
    let (echo, echo_rx) = if with_echo {
        let (tx, rx) = unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let sender = MockSender {
        sent: sent.clone(),
        echo,
    };
    let bus = FrameBus::with_settings(sender, MockReceiver { rx }, settings);
    (bus, MockBusHandle { sent, inject }, echo_rx)
}
