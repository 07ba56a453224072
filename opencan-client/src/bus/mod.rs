//! Shared access to a single CAN interface
//!
//! The [FrameBus] owns the transport. A background task reads frames and offers each one to every
//! [Subscription] whose filter accepts it, so any number of protocol handlers can listen to the
//! same interface without knowing about each other.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanId, CanMessage,
};
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

mod subscription;
mod transport;

pub use subscription::{FrameFilter, Subscription, SubscriptionId};
use subscription::Registry;
use transport::{FrameSink, FrameSource};

use crate::config::BusSettings;

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Errors raised by the frame bus
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum BusError {
    /// The transport failed to write a frame
    #[snafu(display("Failed to send CAN message: {source}"))]
    Send {
        /// Underlying error, holding the frame which was not sent
        source: CanSendError,
    },
    /// The transport failed to read a frame. The read loop keeps running.
    #[snafu(display("Error receiving CAN message: {message}"))]
    Receive {
        /// Description from the transport
        message: String,
    },
    /// The operation needs the read loop, which has not been started
    #[snafu(display("The bus read loop is not running"))]
    NotRunning,
}

struct ReaderTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Box<dyn FrameSource>>,
}

struct BusInner {
    registry: Arc<Mutex<Registry>>,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    /// The receiver, while the read loop is not running
    source: Mutex<Option<Box<dyn FrameSource>>>,
    reader: Mutex<Option<ReaderTask>>,
    error_tx: mpsc::Sender<BusError>,
    error_rx: Mutex<Option<mpsc::Receiver<BusError>>>,
}

/// A CAN interface shared between tasks
///
/// Cloning a `FrameBus` produces another handle to the same interface.
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<BusInner>,
}

impl core::fmt::Debug for FrameBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameBus")
            .field("running", &self.is_running())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl FrameBus {
    /// Create a bus from the two halves of a CAN interface, using default settings
    ///
    /// The read loop does not start until [run](Self::run) is called.
    pub fn new<S, R>(sender: S, receiver: R) -> Self
    where
        S: AsyncCanSender + 'static,
        R: AsyncCanReceiver + 'static,
    {
        Self::with_settings(sender, receiver, BusSettings::default())
    }

    /// Create a bus with explicit channel sizes
    pub fn with_settings<S, R>(sender: S, receiver: R, settings: BusSettings) -> Self
    where
        S: AsyncCanSender + 'static,
        R: AsyncCanReceiver + 'static,
    {
        let (error_tx, error_rx) = mpsc::channel(settings.error_channel_capacity.max(1));
        let source: Box<dyn FrameSource> = Box::new(receiver);
        let sink: Box<dyn FrameSink> = Box::new(sender);
        Self {
            inner: Arc::new(BusInner {
                registry: Arc::new(Mutex::new(Registry::new(settings.channel_capacity))),
                sink: tokio::sync::Mutex::new(sink),
                source: Mutex::new(Some(source)),
                reader: Mutex::new(None),
                error_tx,
                error_rx: Mutex::new(Some(error_rx)),
            }),
        }
    }

    /// Start the background read loop
    ///
    /// Must be called from within a tokio runtime. Calling this while the loop is already running
    /// does nothing.
    pub fn run(&self) {
        let mut reader = self.inner.reader.lock().unwrap();
        if reader.is_some() {
            return;
        }
        let Some(mut source) = self.inner.source.lock().unwrap().take() else {
            log::error!("CAN receiver lost; the bus cannot be restarted");
            return;
        };

        let (stop, mut stop_rx) = oneshot::channel();
        let registry = self.inner.registry.clone();
        let errors = self.inner.error_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    result = source.next_frame() => match result {
                        Ok(msg) => {
                            registry.lock().unwrap().publish(msg);
                        }
                        Err(message) => {
                            log::error!("Error reading CAN bus: {message}");
                            if errors.try_send(BusError::Receive { message }).is_err() {
                                log::debug!("Bus error channel full or closed");
                            }
                            tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            source
        });
        *reader = Some(ReaderTask { stop, handle });
    }

    /// Stop the background read loop
    ///
    /// Waits for the loop to exit. Does nothing if the loop is not running. The bus can be started
    /// again afterwards.
    pub async fn stop(&self) {
        let task = self.inner.reader.lock().unwrap().take();
        let Some(task) = task else {
            return;
        };
        // The loop may already have exited if the sender was dropped
        let _ = task.stop.send(());
        match task.handle.await {
            Ok(source) => *self.inner.source.lock().unwrap() = Some(source),
            Err(e) => log::error!("Bus read loop failed: {e}"),
        }
    }

    /// True while the read loop is running
    pub fn is_running(&self) -> bool {
        self.inner.reader.lock().unwrap().is_some()
    }

    /// Send a frame with the given ID. Data beyond 8 bytes is dropped.
    pub async fn send(&self, id: CanId, data: &[u8]) -> Result<(), BusError> {
        self.send_message(CanMessage::new(id, data)).await
    }

    /// Send a frame
    pub async fn send_message(&self, msg: CanMessage) -> Result<(), BusError> {
        let mut sink = self.inner.sink.lock().await;
        sink.send_frame(msg).await.context(SendSnafu)
    }

    /// Register a new subscription
    ///
    /// When `filter` is given, only frames for which it returns true are delivered. The
    /// subscription is removed when the returned handle is dropped, or by
    /// [release_subscription](Self::release_subscription).
    pub fn acquire_subscription(&self, filter: Option<FrameFilter>) -> Subscription {
        let (id, rx) = self.inner.registry.lock().unwrap().create(filter);
        Subscription::new(id, rx, self.inner.registry.clone())
    }

    /// Subscribe to all frames with one exact ID
    pub fn subscribe_id(&self, id: CanId) -> Subscription {
        self.acquire_subscription(Some(Box::new(move |msg: &CanMessage| msg.id() == id)))
    }

    /// Remove a subscription, closing its channel
    ///
    /// Does nothing if the ID is not registered.
    pub fn release_subscription(&self, id: SubscriptionId) {
        self.inner.registry.lock().unwrap().remove(id);
    }

    /// The number of registered subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    /// Take the channel on which receive errors are reported
    ///
    /// Returns None if it has already been taken. Errors raised while nobody holds the channel are
    /// kept up to the channel capacity, after which they are discarded.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<BusError>> {
        self.inner.error_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_bus, mock_bus_with_settings, MockReceiveError};

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_filtered_delivery() {
        let (bus, handle) = mock_bus();
        bus.run();

        let mut filtered = bus.subscribe_id(CanId::std(0x181));
        let mut all = bus.acquire_subscription(None);

        let msg181 = CanMessage::new(CanId::std(0x181), &[1, 2]);
        let msg182 = CanMessage::new(CanId::std(0x182), &[3, 4]);
        handle.inject(msg181);
        handle.inject(msg182);

        assert_eq!(Some(msg181), filtered.recv().await);
        assert_eq!(Some(msg181), all.recv().await);
        assert_eq!(Some(msg182), all.recv().await);
        assert!(tokio::time::timeout(WAIT, filtered.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_release_subscription() {
        let (bus, _handle) = mock_bus();
        bus.run();

        let mut sub = bus.acquire_subscription(None);
        let other = bus.acquire_subscription(None);
        assert_eq!(2, bus.subscription_count());

        bus.release_subscription(sub.id());
        assert_eq!(1, bus.subscription_count());
        assert_eq!(None, sub.recv().await);

        // Releasing twice is harmless
        bus.release_subscription(sub.id());
        drop(other);
        assert_eq!(0, bus.subscription_count());
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let settings = BusSettings {
            channel_capacity: 2,
            ..Default::default()
        };
        let (bus, handle) = mock_bus_with_settings(settings);
        let mut sub = bus.acquire_subscription(None);
        for i in 0..3u8 {
            handle.inject(CanMessage::new(CanId::std(0x200), &[i]));
        }
        bus.run();
        tokio::time::sleep(WAIT).await;

        assert_eq!(Some(0), sub.try_recv().map(|m| m.data[0]));
        assert_eq!(Some(1), sub.try_recv().map(|m| m.data[0]));
        assert_eq!(None, sub.try_recv());
        // The subscriber is still registered after the overflow
        assert_eq!(1, bus.subscription_count());
    }

    #[tokio::test]
    async fn test_receive_error_forwarded() {
        let (bus, handle) = mock_bus();
        let mut errors = bus.take_errors().unwrap();
        assert!(bus.take_errors().is_none());
        let mut sub = bus.acquire_subscription(None);
        bus.run();

        handle.inject_error(MockReceiveError);
        let msg = CanMessage::new(CanId::std(0x300), &[9]);
        handle.inject(msg);

        assert!(matches!(errors.recv().await, Some(BusError::Receive { .. })));
        // The loop keeps reading after an error
        assert_eq!(Some(msg), sub.recv().await);
    }

    #[tokio::test]
    async fn test_run_is_idempotent_and_restartable() {
        let (bus, handle) = mock_bus();
        let mut sub = bus.acquire_subscription(None);

        bus.stop().await;
        bus.run();
        bus.run();
        assert!(bus.is_running());

        bus.stop().await;
        assert!(!bus.is_running());
        let msg = CanMessage::new(CanId::std(0x400), &[]);
        handle.inject(msg);
        assert!(tokio::time::timeout(WAIT, sub.recv()).await.is_err());

        bus.run();
        assert_eq!(Some(msg), sub.recv().await);
    }

    #[tokio::test]
    async fn test_send_truncates() {
        let (bus, handle) = mock_bus();
        bus.send(CanId::std(0x601), &[0; 10]).await.unwrap();
        let sent = handle.sent();
        assert_eq!(1, sent.len());
        assert_eq!(8, sent[0].dlc);
        assert_eq!(CanId::std(0x601), sent[0].id());
    }
}
