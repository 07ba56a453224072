//! Object safe wrappers around the transport traits
//!
//! The bus stores its transport behind these so that nothing above it needs to be generic over the
//! CAN driver.
use futures::future::BoxFuture;
use opencan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};

pub(crate) trait FrameSink: Send {
    fn send_frame(&mut self, msg: CanMessage) -> BoxFuture<'_, Result<(), CanSendError>>;
}

impl<S: AsyncCanSender> FrameSink for S {
    fn send_frame(&mut self, msg: CanMessage) -> BoxFuture<'_, Result<(), CanSendError>> {
        Box::pin(self.send(msg))
    }
}

pub(crate) trait FrameSource: Send {
    /// Read the next frame. Errors are flattened to their message.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<CanMessage, String>>;
}

impl<R: AsyncCanReceiver> FrameSource for R {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<CanMessage, String>> {
        Box::pin(async move { self.recv().await.map_err(|e| e.to_string()) })
    }
}
