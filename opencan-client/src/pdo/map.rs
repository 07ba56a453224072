use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencan_common::{
    constants::values::{PDO_COB_ID_INVALID, PDO_EXTENDED_ID, PDO_RTR_NOT_ALLOWED},
    CanId,
};
use snafu::ResultExt;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::Instant,
};

use super::{le_uint, NotReadSnafu, ObjectSnafu, PdoError, SaveUnsupportedSnafu, SdoSnafu};
use crate::{
    bus::FrameBus,
    config::PdoSettings,
    object_dict::{Object, ObjectError},
    ObjectDictionary, SdoClient, Variable,
};

struct ChangeWatcher {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

/// State updated by the listener task
#[derive(Default)]
struct PdoShared {
    data: Vec<u8>,
    old_data: Vec<u8>,
    received: bool,
    timestamp: Option<Instant>,
    period: Option<Duration>,
    next_watcher: u64,
    watchers: Vec<ChangeWatcher>,
}

impl PdoShared {
    fn update(&mut self, data: &[u8]) {
        let now = Instant::now();
        if let Some(prev) = self.timestamp {
            self.period = Some(now - prev);
        }
        self.timestamp = Some(now);
        let first = !std::mem::replace(&mut self.received, true);
        self.old_data = std::mem::replace(&mut self.data, data.to_vec());

        if !first && self.data == self.old_data {
            return;
        }
        let data = &self.data;
        self.watchers.retain(|watcher| match watcher.tx.try_send(data.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Dropped PDO change notification for slow subscriber {}", watcher.id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

/// A channel of PDO data, delivered each time the data changes
///
/// Unregisters itself when dropped.
pub struct ChangeSubscription {
    id: u64,
    rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Mutex<PdoShared>>,
}

impl core::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("id", &self.id)
            .finish()
    }
}

impl ChangeSubscription {
    /// ID for use with [PdoMap::release_changes]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next change. Returns None once released.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Get the next change if one is queued
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.watchers.retain(|w| w.id != self.id);
        }
    }
}

/// One PDO of a node
pub struct PdoMap {
    number: u8,
    comm_index: u16,
    map_index: u16,
    sdo: SdoClient,
    bus: FrameBus,
    settings: PdoSettings,
    enabled: bool,
    rtr_allowed: bool,
    cob_id: u32,
    trans_type: u8,
    event_timer: Option<u16>,
    layout: Option<Vec<Variable>>,
    total_bits: usize,
    shared: Arc<Mutex<PdoShared>>,
    listener: Option<JoinHandle<()>>,
}

impl core::fmt::Debug for PdoMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PdoMap")
            .field("number", &self.number)
            .field("comm_index", &self.comm_index)
            .field("map_index", &self.map_index)
            .field("cob_id", &self.cob_id)
            .field("enabled", &self.enabled)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl PdoMap {
    /// Create a PDO whose parameters live at `comm_index` and `map_index`
    ///
    /// Nothing is known about the PDO until [read](Self::read) is called.
    pub fn new(
        number: u8,
        comm_index: u16,
        map_index: u16,
        sdo: SdoClient,
        bus: FrameBus,
        settings: PdoSettings,
    ) -> Self {
        Self {
            number,
            comm_index,
            map_index,
            sdo,
            bus,
            settings,
            enabled: false,
            rtr_allowed: true,
            cob_id: 0,
            trans_type: 0,
            event_timer: None,
            layout: None,
            total_bits: 0,
            shared: Arc::new(Mutex::new(PdoShared::default())),
            listener: None,
        }
    }

    async fn read_param(
        &self,
        dict: &mut ObjectDictionary,
        index: u16,
        sub: u8,
    ) -> Result<u64, PdoError> {
        let data = self
            .sdo
            .upload(index, sub)
            .await
            .context(SdoSnafu { index, sub })?;
        if let Ok(var) = dict.variable_mut(index, sub) {
            var.data = data.clone();
        }
        Ok(le_uint(&data))
    }

    /// Read the PDO's communication and mapping parameters, rebuild the layout, and start
    /// listening for the PDO
    ///
    /// Mapped variables in `dict` get their offset and size within the PDO set, and the node's
    /// SDO client attached.
    pub async fn read(&mut self, dict: &mut ObjectDictionary) -> Result<(), PdoError> {
        self.unlisten();
        // Until every parameter is read back, the PDO has no usable layout
        self.layout = None;
        self.total_bits = 0;

        let cob_id = self.read_param(dict, self.comm_index, 1).await? as u32;
        self.cob_id = cob_id;
        self.enabled = cob_id & PDO_COB_ID_INVALID == 0;
        self.rtr_allowed = cob_id & PDO_RTR_NOT_ALLOWED == 0;

        let trans_type = self.read_param(dict, self.comm_index, 2).await?;
        self.trans_type = trans_type as u8;
        self.event_timer = None;
        if trans_type > 254 && dict.variable(self.comm_index, 5).is_ok() {
            self.event_timer = Some(self.read_param(dict, self.comm_index, 5).await? as u16);
        }

        let count = self.read_param(dict, self.map_index, 0).await? as u8;
        let mut layout = Vec::new();
        let mut offset_bits = 0usize;
        for i in 1..=count {
            let entry = self.read_param(dict, self.map_index, i).await? as u32;
            let index = (entry >> 16) as u16;
            let sub = ((entry >> 8) & 0xFF) as u8;
            let bits = (entry & 0xFF) as usize;
            if bits == 0 {
                continue;
            }

            let object = dict.find_index_mut(index).context(ObjectSnafu)?;
            let var = match object {
                Object::Variable(var) => var,
                Object::Array(c) | Object::Record(c) => c
                    .find_index_mut(sub)
                    .ok_or(ObjectError::NotFound { index, sub })
                    .context(ObjectSnafu)?,
            };
            var.size = bits / 8;
            var.offset = offset_bits / 8;
            var.attach_sdo(self.sdo.clone());
            log::debug!(
                "PDO {} maps {:#06x}sub{} '{}' at byte {} ({} bits)",
                self.number,
                index,
                sub,
                var.name,
                var.offset,
                bits
            );
            layout.push(var.clone());
            offset_bits += bits;
        }

        self.total_bits = offset_bits;
        self.layout = Some(layout);
        {
            let len = offset_bits.div_ceil(8);
            let mut shared = self.shared.lock().unwrap();
            shared.data = vec![0; len];
            shared.old_data = vec![0; len];
            shared.received = false;
            shared.timestamp = None;
            shared.period = None;
        }

        self.listen()
    }

    /// Start listening for the PDO on the bus
    ///
    /// Fails if the layout has not been read. Does nothing if already listening.
    pub fn listen(&mut self) -> Result<(), PdoError> {
        if self.layout.is_none() {
            return NotReadSnafu {
                number: self.number,
            }
            .fail();
        }
        if self.is_listening() {
            return Ok(());
        }
        let mut subscription = self.bus.subscribe_id(self.can_id());
        let shared = self.shared.clone();
        self.listener = Some(tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                shared.lock().unwrap().update(msg.data());
            }
        }));
        Ok(())
    }

    /// Stop listening for the PDO
    pub fn unlisten(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }

    /// True while the listener is running
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Register for change notifications
    ///
    /// The first frame after a read, and each frame which differs from the previous one, is
    /// offered to every subscriber. A subscriber whose channel is full misses that update.
    pub fn subscribe_changes(&self) -> ChangeSubscription {
        let (tx, rx) = mpsc::channel(self.settings.change_channel_capacity.max(1));
        let mut shared = self.shared.lock().unwrap();
        let id = shared.next_watcher;
        shared.next_watcher += 1;
        shared.watchers.push(ChangeWatcher { id, tx });
        ChangeSubscription {
            id,
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Remove a change subscription, closing its channel
    ///
    /// Returns false if the ID is not registered.
    pub fn release_changes(&self, id: u64) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let before = shared.watchers.len();
        shared.watchers.retain(|w| w.id != id);
        before != shared.watchers.len()
    }

    /// The PDO number within its set, starting at 1
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Index of the communication parameter record
    pub fn comm_index(&self) -> u16 {
        self.comm_index
    }

    /// Index of the mapping parameter array
    pub fn map_index(&self) -> u16 {
        self.map_index
    }

    /// The raw COB-ID parameter, including flag bits
    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    /// The CAN ID the PDO is sent with
    pub fn can_id(&self) -> CanId {
        if self.cob_id & PDO_EXTENDED_ID != 0 {
            CanId::Extended(self.cob_id & 0x1FFF_FFFF)
        } else {
            CanId::Std((self.cob_id & 0x7FF) as u16)
        }
    }

    /// True if the PDO is valid
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True if remote requests are allowed
    pub fn rtr_allowed(&self) -> bool {
        self.rtr_allowed
    }

    /// The transmission type
    pub fn trans_type(&self) -> u8 {
        self.trans_type
    }

    /// The event timer, in ms, when the transmission type is event driven
    pub fn event_timer(&self) -> Option<u16> {
        self.event_timer
    }

    /// The mapped variables, in PDO order. Empty until read.
    pub fn layout(&self) -> &[Variable] {
        self.layout.as_deref().unwrap_or_default()
    }

    /// Total mapped length in bits
    pub fn total_size(&self) -> usize {
        self.total_bits
    }

    /// Find a mapped variable by object index
    pub fn find_index(&self, index: u16) -> Option<&Variable> {
        self.layout().iter().find(|v| v.index == index)
    }

    /// Find a mapped variable by name
    pub fn find_name(&self, name: &str) -> Option<&Variable> {
        self.layout().iter().find(|v| v.name == name)
    }

    /// A copy of a mapped variable holding its slice of the latest PDO data
    pub fn value(&self, name: &str) -> Option<Variable> {
        let mut var = self.find_name(name)?.clone();
        let shared = self.shared.lock().unwrap();
        var.data = shared
            .data
            .get(var.offset..var.offset + var.size)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        Some(var)
    }

    /// The latest PDO data
    pub fn data(&self) -> Vec<u8> {
        self.shared.lock().unwrap().data.clone()
    }

    /// The PDO data before the latest frame
    pub fn old_data(&self) -> Vec<u8> {
        self.shared.lock().unwrap().old_data.clone()
    }

    /// True once a frame has been received since the last read
    pub fn is_received(&self) -> bool {
        self.shared.lock().unwrap().received
    }

    /// When the latest frame was received
    pub fn timestamp(&self) -> Option<Instant> {
        self.shared.lock().unwrap().timestamp
    }

    /// Time between the two latest frames
    pub fn period(&self) -> Option<Duration> {
        self.shared.lock().unwrap().period
    }

    /// Write the PDO configuration back to the node. Not supported.
    pub async fn save(&self) -> Result<(), PdoError> {
        SaveUnsupportedSnafu.fail()
    }
}

impl Drop for PdoMap {
    fn drop(&mut self) {
        self.unlisten();
    }
}

#[cfg(test)]
mod tests {
    use opencan_common::{
        objects::{AccessType, DataType},
        CanMessage, NodeId,
    };

    use super::*;
    use crate::{config::SdoSettings, test_utils::mock_bus};

    fn test_map(bus: &FrameBus, cob_id: u32) -> PdoMap {
        let sdo = SdoClient::new_std(NodeId::new(1).unwrap(), bus.clone());
        let mut map = PdoMap::new(1, 0x1800, 0x1A00, sdo, bus.clone(), PdoSettings::default());
        map.cob_id = cob_id;
        let mut var = Variable::new(0x3000, 1, "speed", DataType::UInt16, AccessType::Ro);
        var.offset = 0;
        var.size = 2;
        map.layout = Some(vec![var]);
        map.total_bits = 16;
        map
    }

    #[test]
    fn test_can_id_from_cob_id() {
        let (bus, _handle) = mock_bus();
        assert_eq!(CanId::std(0x181), test_map(&bus, 0x4000_0181).can_id());
        assert_eq!(
            CanId::extended(0x0234_5678),
            test_map(&bus, PDO_EXTENDED_ID | 0x0234_5678).can_id()
        );
    }

    #[tokio::test]
    async fn test_listen_before_read_fails() {
        let (bus, _handle) = mock_bus();
        let sdo = SdoClient::new_std(NodeId::new(1).unwrap(), bus.clone());
        let mut map = PdoMap::new(3, 0x1802, 0x1A02, sdo, bus, PdoSettings::default());
        assert!(matches!(map.listen(), Err(PdoError::NotRead { number: 3 })));
        assert!(matches!(map.save().await, Err(PdoError::SaveUnsupported)));
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let (bus, handle) = mock_bus();
        bus.run();
        let mut map = test_map(&bus, 0x181);
        map.listen().unwrap();
        let mut changes = map.subscribe_changes();

        handle.inject(CanMessage::new(CanId::std(0x181), &[0x34, 0x12]));
        assert_eq!(Some(vec![0x34, 0x12]), changes.recv().await);
        assert!(map.is_received());
        assert_eq!(Some(0x1234), map.value("speed").unwrap().get_uint_val());

        // Same data again: no notification
        handle.inject(CanMessage::new(CanId::std(0x181), &[0x34, 0x12]));
        handle.inject(CanMessage::new(CanId::std(0x181), &[0x35, 0x12]));
        assert_eq!(Some(vec![0x35, 0x12]), changes.recv().await);
        assert_eq!(vec![0x34, 0x12], map.old_data());
        assert!(map.period().is_some());

        assert!(map.release_changes(changes.id()));
        assert!(!map.release_changes(changes.id()));
        assert_eq!(None, changes.recv().await);
    }

    #[tokio::test]
    async fn test_first_frame_always_notifies() {
        let (bus, handle) = mock_bus();
        bus.run();
        let mut map = test_map(&bus, 0x181);
        map.shared.lock().unwrap().data = vec![0; 2];
        map.listen().unwrap();
        let mut changes = map.subscribe_changes();

        handle.inject(CanMessage::new(CanId::std(0x181), &[0, 0]));
        assert_eq!(Some(vec![0, 0]), changes.recv().await);
        assert!(map.is_received());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_clears_layout() {
        let (bus, _handle) = mock_bus();
        bus.run();
        let mut map = test_map(&bus, 0x181);
        map.sdo = SdoClient::with_settings(
            NodeId::new(1).unwrap(),
            bus.clone(),
            SdoSettings {
                timeout_ms: 10,
                retries: 1,
            },
        );
        map.listen().unwrap();

        let mut dict = ObjectDictionary::new();
        assert!(matches!(
            map.read(&mut dict).await,
            Err(PdoError::Sdo { index: 0x1800, sub: 1, .. })
        ));
        assert!(!map.is_listening());
        assert!(map.layout().is_empty());
        assert_eq!(0, map.total_size());
        assert!(matches!(map.listen(), Err(PdoError::NotRead { number: 1 })));
    }

    #[tokio::test]
    async fn test_unlisten_releases_subscription() {
        let (bus, _handle) = mock_bus();
        let mut map = test_map(&bus, 0x181);
        map.listen().unwrap();
        assert!(map.is_listening());
        assert_eq!(1, bus.subscription_count());

        map.unlisten();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!map.is_listening());
        assert_eq!(0, bus.subscription_count());
    }
}
