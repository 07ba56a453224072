use std::sync::Arc;

use opencan_common::{
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use snafu::Snafu;
use socketcan::{tokio::CanSocket, CanFrame, EmbeddedFrame, Frame, IoError, ShouldRetry};

fn from_socketcan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn to_socketcan_id(id: CanId) -> Option<socketcan::CanId> {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).map(Into::into),
        CanId::Std(id) => socketcan::StandardId::new(id).map(Into::into),
    }
}

fn to_socketcan_frame(msg: &CanMessage) -> Option<CanFrame> {
    CanFrame::new(to_socketcan_id(msg.id())?, msg.data())
}

/// Errors reading from a socketcan interface
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// The socket read failed
    #[snafu(display("socketcan read failed: {source}"))]
    Io {
        /// Underlying error
        source: IoError,
    },
    /// The controller reported an error frame
    #[snafu(display("CAN error frame: {bits:#x}"))]
    ErrorFrame {
        /// Error class bits from the frame
        bits: u32,
    },
}

/// Receive half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    /// The tokio socket has no non-blocking read, so this never returns a message
    fn try_recv(&mut self) -> Result<Option<CanMessage>, ReceiveError> {
        Ok(None)
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(CanFrame::Data(frame)) => {
                    return Ok(CanMessage::new(
                        from_socketcan_id(frame.can_id()),
                        frame.data(),
                    ))
                }
                Ok(CanFrame::Remote(frame)) => {
                    log::debug!("Ignoring remote frame {:?}", frame.can_id());
                }
                Ok(CanFrame::Error(frame)) => {
                    return ErrorFrameSnafu {
                        bits: frame.error_bits(),
                    }
                    .fail()
                }
                Err(e) if e.should_retry() => (),
                Err(source) => return Err(ReceiveError::Io { source }),
            }
        }
    }
}

/// Transmit half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let frame = to_socketcan_frame(&msg).ok_or(CanSendError(msg))?;
        self.socket.write_frame(frame).await.map_err(|e| {
            log::error!("socketcan write failed: {e}");
            CanSendError(msg)
        })
    }
}

/// Open a socketcan device, e.g. "vcan0" or "can0", as a sender and receiver pair
///
/// Both halves share one socket, so the receiver does not see frames sent by the sender.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), IoError> {
    let socket = Arc::new(CanSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_conversion() {
        for id in [CanId::std(0x581), CanId::extended(0x1234_5678)] {
            assert_eq!(id, from_socketcan_id(to_socketcan_id(id).unwrap()));
        }
        assert!(to_socketcan_id(CanId::std(0x800)).is_none());
    }

    #[test]
    fn test_frame_conversion() {
        let msg = CanMessage::new(CanId::std(0x601), &[0x40, 0x00, 0x10, 0x00]);
        let frame = to_socketcan_frame(&msg).unwrap();
        assert_eq!(msg.data(), frame.data());
        assert_eq!(msg.id(), from_socketcan_id(frame.can_id()));
    }
}
