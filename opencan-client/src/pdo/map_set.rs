use std::collections::BTreeMap;

use opencan_common::constants::values::PDO_SLOTS;

use super::{PdoError, PdoMap};
use crate::{bus::FrameBus, config::PdoSettings, ObjectDictionary, SdoClient};

/// All PDOs of one direction on a node, keyed by PDO number (starting at 1)
#[derive(Debug, Default)]
pub struct PdoMapSet {
    maps: BTreeMap<u8, PdoMap>,
}

impl PdoMapSet {
    /// Scan `dict` for PDO parameter objects
    ///
    /// Each of the 32 communication parameter indices starting at `comm_base` which exists, and has
    /// a mapping parameter at the same offset from `map_base`, becomes one [PdoMap].
    pub fn new(
        dict: &ObjectDictionary,
        comm_base: u16,
        map_base: u16,
        sdo: &SdoClient,
        bus: &FrameBus,
        settings: PdoSettings,
    ) -> Self {
        let mut maps = BTreeMap::new();
        for i in 0..PDO_SLOTS {
            let comm_index = comm_base + i;
            if dict.find_index(comm_index).is_err() {
                continue;
            }
            let map_index = map_base + i;
            if dict.find_index(map_index).is_err() {
                log::warn!(
                    "PDO communication object {comm_index:#06x} has no mapping object {map_index:#06x}"
                );
                continue;
            }
            let number = i as u8 + 1;
            maps.insert(
                number,
                PdoMap::new(
                    number,
                    comm_index,
                    map_index,
                    sdo.clone(),
                    bus.clone(),
                    settings,
                ),
            );
        }
        Self { maps }
    }

    /// Get a PDO by number
    pub fn find_index(&self, number: u8) -> Option<&PdoMap> {
        self.maps.get(&number)
    }

    /// Get a PDO by number, mutably
    pub fn find_index_mut(&mut self, number: u8) -> Option<&mut PdoMap> {
        self.maps.get_mut(&number)
    }

    /// Find the PDO which maps a variable with the given name
    pub fn find_by_name(&self, name: &str) -> Option<&PdoMap> {
        self.maps.values().find(|map| map.find_name(name).is_some())
    }

    /// Iterate over the PDOs in number order
    pub fn iter(&self) -> impl Iterator<Item = &PdoMap> {
        self.maps.values()
    }

    /// Iterate mutably over the PDOs in number order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PdoMap> {
        self.maps.values_mut()
    }

    /// The number of PDOs
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// True if the node has no PDOs in this direction
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Read every PDO's layout, and start listening
    pub async fn read(&mut self, dict: &mut ObjectDictionary) -> Result<(), PdoError> {
        for map in self.maps.values_mut() {
            map.read(dict).await?;
        }
        Ok(())
    }

    /// Stop listening on every PDO
    pub fn unlisten(&mut self) {
        for map in self.maps.values_mut() {
            map.unlisten();
        }
    }
}
