use std::sync::Arc;
use std::time::Duration;

use opencan_common::{
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    CanId, CanMessage, NodeId,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

use crate::bus::{BusError, FrameBus, FrameFilter};
use crate::config::SdoSettings;

/// Decides whether a received SDO response answers the request in flight
pub type ResponseMatcher = Box<dyn Fn(&SdoResponse) -> bool + Send + Sync>;

/// Errors returned by SDO transfers
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// No matching response arrived within the timeout, after all retries
    #[snafu(display("No response from SDO server"))]
    NoResponse,
    /// A frame with the response ID could not be decoded
    #[snafu(display("Malformed SDO response"))]
    MalformedResponse,
    /// A response of the wrong kind was received
    #[snafu(display("Unexpected SDO response"))]
    UnexpectedResponse,
    /// The server aborted the transfer
    #[snafu(display(
        "SDO server aborted transfer of {index:#06x}sub{sub} with code {abort_code:#010x} ({:?})",
        AbortCode::from_raw(*abort_code)
    ))]
    ServerAbort {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Raw abort code
        abort_code: u32,
    },
    /// A segment arrived with the wrong toggle bit
    #[snafu(display("Toggle bit not alternated during transfer of {index:#06x}sub{sub}"))]
    ToggleNotAlternated {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// Segmented download is not implemented
    #[snafu(display("Segmented SDO download ({len} bytes) is not supported"))]
    SegmentedDownloadUnsupported {
        /// The length of the rejected payload
        len: usize,
    },
    /// An upload returned fewer bytes than the requested type needs
    #[snafu(display("Expected {expected} bytes, received {actual}"))]
    UnexpectedSize {
        /// Bytes needed
        expected: usize,
        /// Bytes received
        actual: usize,
    },
    /// The bus failed to send a request
    #[snafu(display("Bus error: {source}"))]
    Bus {
        /// Underlying error
        source: BusError,
    },
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// A client for accessing a node's SDO server
///
/// Requests go to `0x600 + node_id`, responses are expected on `0x580 + node_id`. Clones share one
/// request queue, so transfers to a node are carried out one at a time in the order they were
/// started, while transfers to different nodes run independently.
#[derive(Clone)]
pub struct SdoClient {
    node_id: NodeId,
    req_cob_id: CanId,
    resp_cob_id: CanId,
    bus: FrameBus,
    queue: Arc<Mutex<()>>,
    settings: SdoSettings,
}

impl core::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoClient")
            .field("node_id", &self.node_id)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SdoClient {
    /// Create a client for the standard SDO server of a node
    pub fn new_std(node_id: NodeId, bus: FrameBus) -> Self {
        Self::with_settings(node_id, bus, SdoSettings::default())
    }

    /// Create a client with explicit timing
    pub fn with_settings(node_id: NodeId, bus: FrameBus, settings: SdoSettings) -> Self {
        Self {
            node_id,
            req_cob_id: CanId::Std(SDO_REQ_BASE + node_id.raw() as u16),
            resp_cob_id: CanId::Std(SDO_RESP_BASE + node_id.raw() as u16),
            bus,
            queue: Arc::new(Mutex::new(())),
            settings,
        }
    }

    /// The node this client talks to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The timing used for requests
    pub fn settings(&self) -> SdoSettings {
        self.settings
    }

    /// Send a single request
    ///
    /// Without a matcher, the request is sent and `None` returned immediately. With a matcher, the
    /// request is sent up to `retries` times, waiting `timeout` for a response the first time and
    /// doubling the wait on each retry. Responses for which the matcher returns false are ignored.
    pub async fn send(
        &self,
        request: SdoRequest,
        matcher: Option<ResponseMatcher>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Option<SdoResponse>> {
        let _turn = self.queue.lock().await;
        match matcher {
            Some(matcher) => self
                .exchange(request, matcher, timeout, retries)
                .await
                .map(Some),
            None => {
                self.send_request(request).await?;
                Ok(None)
            }
        }
    }

    async fn send_request(&self, request: SdoRequest) -> Result<()> {
        self.bus
            .send_message(request.to_can_message(self.req_cob_id))
            .await
            .context(BusSnafu)
    }

    /// Send a request and wait for the matching response. The caller must hold the queue.
    async fn exchange(
        &self,
        request: SdoRequest,
        matcher: ResponseMatcher,
        timeout: Duration,
        retries: u32,
    ) -> Result<SdoResponse> {
        let resp_cob_id = self.resp_cob_id;
        // Frames on the response ID which do not decode are ignored like any other non-match
        let filter: FrameFilter = Box::new(move |msg: &CanMessage| {
            msg.id() == resp_cob_id
                && SdoResponse::try_from(*msg).is_ok_and(|resp| matcher(&resp))
        });
        let mut subscription = self.bus.acquire_subscription(Some(filter));

        let attempts = retries.max(1);
        let mut wait = timeout;
        for attempt in 1..=attempts {
            self.send_request(request).await?;
            match tokio::time::timeout(wait, subscription.recv()).await {
                Ok(Some(msg)) => {
                    return SdoResponse::try_from(msg).map_err(|_| MalformedResponseSnafu.build())
                }
                Ok(None) => break,
                Err(_) => {
                    log::debug!(
                        "No SDO response from node {} after {:?} (attempt {}/{})",
                        self.node_id,
                        wait,
                        attempt,
                        attempts
                    );
                    wait *= 2;
                }
            }
        }
        NoResponseSnafu.fail()
    }

    async fn request(&self, request: SdoRequest, matcher: ResponseMatcher) -> Result<SdoResponse> {
        self.exchange(
            request,
            matcher,
            self.settings.timeout(),
            self.settings.retries,
        )
        .await
    }

    async fn send_abort(&self, index: u16, sub: u8, abort_code: AbortCode) {
        if let Err(e) = self
            .send_request(SdoRequest::abort(index, sub, abort_code))
            .await
        {
            log::warn!("Failed to send SDO abort to node {}: {e}", self.node_id);
        }
    }

    /// Read a sub object from the SDO server
    ///
    /// Uses an expedited transfer when the server offers one, otherwise reads segments until the
    /// server marks the last one.
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let _turn = self.queue.lock().await;

        let resp = self
            .request(
                SdoRequest::initiate_upload(index, sub),
                Box::new(move |resp: &SdoResponse| match *resp {
                    SdoResponse::ConfirmUpload { index: i, sub: s, .. }
                    | SdoResponse::Abort { index: i, sub: s, .. } => i == index && s == sub,
                    _ => false,
                }),
            )
            .await?;

        match resp {
            SdoResponse::ConfirmUpload {
                n, e, s, data, ..
            } => {
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    return Ok(data[0..len].to_vec());
                }
                let declared = s.then(|| u32::from_le_bytes(data) as usize);
                self.upload_segments(index, sub, declared).await
            }
            SdoResponse::Abort { abort_code, .. } => ServerAbortSnafu {
                index,
                sub,
                abort_code,
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    async fn upload_segments(
        &self,
        index: u16,
        sub: u8,
        declared: Option<usize>,
    ) -> Result<Vec<u8>> {
        let mut read_buf = Vec::with_capacity(declared.unwrap_or(0));
        let mut toggle = false;
        loop {
            let resp = self
                .request(
                    SdoRequest::upload_segment_request(toggle),
                    Box::new(move |resp: &SdoResponse| match *resp {
                        SdoResponse::UploadSegment { .. } => true,
                        SdoResponse::Abort { index: i, sub: s, .. } => i == index && s == sub,
                        _ => false,
                    }),
                )
                .await?;

            match resp {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    if t != toggle {
                        self.send_abort(index, sub, AbortCode::ToggleNotAlternated)
                            .await;
                        return ToggleNotAlternatedSnafu { index, sub }.fail();
                    }
                    read_buf.extend_from_slice(&data[0..7 - n as usize]);
                    if c {
                        break;
                    }
                }
                SdoResponse::Abort { abort_code, .. } => {
                    return ServerAbortSnafu {
                        index,
                        sub,
                        abort_code,
                    }
                    .fail()
                }
                _ => return UnexpectedResponseSnafu.fail(),
            }
            toggle = !toggle;
        }

        if let Some(size) = declared {
            if size != read_buf.len() {
                log::warn!(
                    "Segmented upload of {index:#06x}sub{sub} declared {size} bytes, received {}",
                    read_buf.len()
                );
            }
        }
        Ok(read_buf)
    }

    /// Write a sub object on the SDO server
    ///
    /// Only expedited transfers (up to 4 bytes) are supported. Longer payloads, or
    /// `force_segment`, fail without sending anything.
    pub async fn download(&self, index: u16, sub: u8, data: &[u8], force_segment: bool) -> Result<()> {
        if force_segment || data.len() > 4 {
            return SegmentedDownloadUnsupportedSnafu { len: data.len() }.fail();
        }
        let _turn = self.queue.lock().await;

        let resp = self
            .request(
                SdoRequest::expedited_download(index, sub, data),
                Box::new(move |resp: &SdoResponse| match *resp {
                    SdoResponse::ConfirmDownload { index: i, sub: s }
                    | SdoResponse::Abort { index: i, sub: s, .. } => i == index && s == sub,
                    _ => false,
                }),
            )
            .await?;

        match resp {
            SdoResponse::ConfirmDownload { .. } => Ok(()),
            SdoResponse::Abort { abort_code, .. } => ServerAbortSnafu {
                index,
                sub,
                abort_code,
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    async fn upload_exact<const N: usize>(&self, index: u16, sub: u8) -> Result<[u8; N]> {
        let data = self.upload(index, sub).await?;
        if data.len() < N {
            return UnexpectedSizeSnafu {
                expected: N,
                actual: data.len(),
            }
            .fail();
        }
        let mut value = [0; N];
        value.copy_from_slice(&data[0..N]);
        Ok(value)
    }

    /// Read a u8 sub object
    pub async fn upload_u8(&self, index: u16, sub: u8) -> Result<u8> {
        Ok(u8::from_le_bytes(self.upload_exact(index, sub).await?))
    }

    /// Read a u16 sub object
    pub async fn upload_u16(&self, index: u16, sub: u8) -> Result<u16> {
        Ok(u16::from_le_bytes(self.upload_exact(index, sub).await?))
    }

    /// Read a u32 sub object
    pub async fn upload_u32(&self, index: u16, sub: u8) -> Result<u32> {
        Ok(u32::from_le_bytes(self.upload_exact(index, sub).await?))
    }

    /// Read a string sub object. Trailing null bytes are removed.
    pub async fn upload_string(&self, index: u16, sub: u8) -> Result<String> {
        let data = self.upload(index, sub).await?;
        let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        Ok(String::from_utf8_lossy(&data[0..end]).into_owned())
    }

    /// Write a u8 sub object
    pub async fn download_u8(&self, index: u16, sub: u8, value: u8) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes(), false).await
    }

    /// Write a u16 sub object
    pub async fn download_u16(&self, index: u16, sub: u8, value: u16) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes(), false).await
    }

    /// Write a u32 sub object
    pub async fn download_u32(&self, index: u16, sub: u8, value: u32) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes(), false).await
    }
}
