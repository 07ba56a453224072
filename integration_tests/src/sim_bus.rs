//! An in-memory CAN bus
//!
//! Every frame sent by one participant is delivered to all other participants, and recorded in the
//! bus history.
use std::sync::{Arc, Mutex};

use opencan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};
use snafu::Snafu;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct SimBusInner {
    next_id: usize,
    queues: Vec<(usize, UnboundedSender<CanMessage>)>,
    history: Vec<CanMessage>,
}

/// A simulated bus
#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<SimBusInner>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new participant
    pub fn new_pair(&self) -> (SimBusSender, SimBusReceiver) {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.queues.push((id, tx));
        (
            SimBusSender {
                id,
                inner: self.inner.clone(),
            },
            SimBusReceiver { rx },
        )
    }

    /// Every frame sent so far, in order
    pub fn history(&self) -> Vec<CanMessage> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }
}

pub struct SimBusSender {
    id: usize,
    inner: Arc<Mutex<SimBusInner>>,
}

impl SimBusSender {
    fn deliver(&self, msg: CanMessage) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.push(msg);
        // Receivers which have been dropped are pruned
        inner
            .queues
            .retain(|(id, tx)| *id == self.id || tx.send(msg).is_ok());
    }
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.deliver(msg);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Simulated bus closed"))]
pub struct SimBusClosed;

pub struct SimBusReceiver {
    rx: UnboundedReceiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = SimBusClosed;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, SimBusClosed> {
        Ok(self.rx.try_recv().ok())
    }

    async fn recv(&mut self) -> Result<CanMessage, SimBusClosed> {
        self.rx.recv().await.ok_or(SimBusClosed)
    }
}
