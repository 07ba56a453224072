//! A simulated CANopen device
//!
//! Serves SDO uploads (expedited and segmented) and expedited downloads from an in-memory object
//! table, follows NMT commands, and reports its state with a heartbeat on every change.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use opencan_common::{
    messages::{Heartbeat, NmtCommand, NmtState, NMT_CMD_ID, SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage,
};
use tokio::task::JoinHandle;

use crate::sim_bus::{SimBus, SimBusSender};

struct SegmentedUpload {
    index: u16,
    sub: u8,
    data: Vec<u8>,
    pos: usize,
    toggle: bool,
}

#[derive(Default)]
struct DeviceState {
    objects: BTreeMap<(u16, u8), Vec<u8>>,
    nmt_state: NmtState,
    upload: Option<SegmentedUpload>,
    aborts_received: Vec<u32>,
}

/// Configuration of a simulated device, consumed by [spawn](Self::spawn)
pub struct SimDevice {
    node_id: u8,
    objects: BTreeMap<(u16, u8), Vec<u8>>,
    response_delay: Duration,
    corrupt_toggle: bool,
}

impl SimDevice {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            objects: BTreeMap::new(),
            response_delay: Duration::ZERO,
            corrupt_toggle: false,
        }
    }

    pub fn with_object(mut self, index: u16, sub: u8, data: &[u8]) -> Self {
        self.objects.insert((index, sub), data.to_vec());
        self
    }

    /// Wait this long before answering each SDO request
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Send upload segments with the wrong toggle bit
    pub fn with_corrupt_toggle(mut self) -> Self {
        self.corrupt_toggle = true;
        self
    }

    /// Attach the device to a bus and start serving requests
    pub fn spawn(self, bus: &SimBus) -> SimDeviceHandle {
        let (mut sender, mut receiver) = bus.new_pair();
        let state = Arc::new(Mutex::new(DeviceState {
            objects: self.objects,
            ..Default::default()
        }));
        let node_id = self.node_id;
        let delay = self.response_delay;
        let corrupt_toggle = self.corrupt_toggle;
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok(msg) = receiver.recv().await {
                if msg.id() == NMT_CMD_ID {
                    let Ok(cmd) = NmtCommand::try_from(msg) else {
                        continue;
                    };
                    if cmd.node == 0 || cmd.node == node_id {
                        // A reset reports bootup, then settles in pre-operational
                        let reported = cmd.cs.resulting_state();
                        task_state.lock().unwrap().nmt_state = match reported {
                            NmtState::Initialising => NmtState::PreOperational,
                            state => state,
                        };
                        send_heartbeat(&mut sender, node_id, reported).await;
                    }
                } else if msg.id() == CanId::std(SDO_REQ_BASE + node_id as u16) {
                    let Ok(req) = SdoRequest::try_from(msg.data()) else {
                        continue;
                    };
                    let response =
                        handle_sdo(&mut task_state.lock().unwrap(), req, corrupt_toggle);
                    if let Some(response) = response {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let resp_id = CanId::std(SDO_RESP_BASE + node_id as u16);
                        let _ = sender.send(response.to_can_message(resp_id)).await;
                    }
                }
            }
        });
        let (sender, _) = bus.new_pair();
        SimDeviceHandle {
            node_id,
            state,
            sender,
            task,
        }
    }
}

async fn send_heartbeat(sender: &mut SimBusSender, node: u8, state: NmtState) {
    let _ = sender
        .send(
            Heartbeat {
                node,
                toggle: false,
                state,
            }
            .into(),
        )
        .await;
}

fn handle_sdo(
    state: &mut DeviceState,
    req: SdoRequest,
    corrupt_toggle: bool,
) -> Option<SdoResponse> {
    match req {
        SdoRequest::InitiateUpload { index, sub } => {
            state.upload = None;
            let Some(data) = state.objects.get(&(index, sub)).cloned() else {
                return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchObject));
            };
            if data.len() <= 4 {
                Some(SdoResponse::expedited_upload(index, sub, &data))
            } else {
                let size = data.len() as u32;
                state.upload = Some(SegmentedUpload {
                    index,
                    sub,
                    data,
                    pos: 0,
                    toggle: false,
                });
                Some(SdoResponse::upload_acknowledge(index, sub, size))
            }
        }
        SdoRequest::ReqUploadSegment { t } => {
            let Some(upload) = state.upload.as_mut() else {
                return Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
            };
            if t != upload.toggle {
                let (index, sub) = (upload.index, upload.sub);
                state.upload = None;
                return Some(SdoResponse::abort(index, sub, AbortCode::ToggleNotAlternated));
            }
            let end = (upload.pos + 7).min(upload.data.len());
            let chunk = upload.data[upload.pos..end].to_vec();
            let complete = end == upload.data.len();
            let sent_toggle = upload.toggle ^ corrupt_toggle;
            upload.pos = end;
            upload.toggle = !upload.toggle;
            if complete {
                state.upload = None;
            }
            Some(SdoResponse::upload_segment(sent_toggle, complete, &chunk))
        }
        SdoRequest::InitiateDownload {
            n,
            e,
            s,
            index,
            sub,
            data,
        } => {
            if !e {
                return Some(SdoResponse::abort(index, sub, AbortCode::UnsupportedAccess));
            }
            if !state.objects.contains_key(&(index, sub)) {
                return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchObject));
            }
            let len = if s { 4 - n as usize } else { 4 };
            state.objects.insert((index, sub), data[..len].to_vec());
            Some(SdoResponse::download_acknowledge(index, sub))
        }
        SdoRequest::DownloadSegment { .. } => Some(SdoResponse::abort(
            0,
            0,
            AbortCode::InvalidCommandSpecifier,
        )),
        SdoRequest::Abort { abort_code, .. } => {
            state.upload = None;
            state.aborts_received.push(abort_code);
            None
        }
    }
}

/// A running simulated device
pub struct SimDeviceHandle {
    node_id: u8,
    state: Arc<Mutex<DeviceState>>,
    sender: SimBusSender,
    task: JoinHandle<()>,
}

impl SimDeviceHandle {
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The current value of an object
    pub fn object(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(&(index, sub)).cloned()
    }

    pub fn nmt_state(&self) -> NmtState {
        self.state.lock().unwrap().nmt_state
    }

    /// Abort codes sent to the device by clients
    pub fn aborts_received(&self) -> Vec<u32> {
        self.state.lock().unwrap().aborts_received.clone()
    }

    /// Send the bootup message, and enter pre-operational
    pub async fn boot(&mut self) {
        self.state.lock().unwrap().nmt_state = NmtState::PreOperational;
        send_heartbeat(&mut self.sender, self.node_id, NmtState::Initialising).await;
    }

    /// Send a frame from the device, e.g. a PDO
    pub async fn send(&mut self, id: CanId, data: &[u8]) {
        let _ = self.sender.send(CanMessage::new(id, data)).await;
    }
}

impl Drop for SimDeviceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
