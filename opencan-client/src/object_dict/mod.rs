//! Object dictionary model
//!
//! An [ObjectDictionary] describes the parameters of a device. It is normally built once from a
//! device description file, then copied into each [Node](crate::Node) using that description.
use std::collections::{BTreeMap, HashMap};

use snafu::{OptionExt, Snafu};

mod objects;
mod variable;

pub use objects::{Composite, Object};
pub use variable::Variable;

use crate::sdo_client::{SdoClient, SdoClientError};

/// Errors accessing object dictionary entries
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ObjectError {
    /// The variable has no SDO client to read or write with
    #[snafu(display("No SDO client attached to {index:#06x}sub{sub}"))]
    NoSdoClient {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// No entry exists at the address
    #[snafu(display("No object at {index:#06x}sub{sub}"))]
    NotFound {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// No entry has the name
    #[snafu(display("No object named '{name}'"))]
    NameNotFound {
        /// The name searched for
        name: String,
    },
    /// A value operation was attempted on an array or record
    #[snafu(display("Object {index:#06x} is not a variable"))]
    NotAVariable {
        /// Object index
        index: u16,
    },
    /// The operation is not implemented for this data type
    #[snafu(display("Unsupported operation: {what}"))]
    Unsupported {
        /// Description of the operation
        what: &'static str,
    },
    /// The SDO transfer failed
    #[snafu(display("SDO transfer for {index:#06x}sub{sub} failed: {source}"))]
    Sdo {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Underlying error
        source: SdoClientError,
    },
}

/// The object dictionary of one device type
#[derive(Clone, Debug, Default)]
pub struct ObjectDictionary {
    /// Bit rate from the device commissioning section, in kbit/s
    pub baud_rate: u32,
    /// Node ID from the device commissioning section
    pub node_id: u8,
    objects: BTreeMap<u16, Object>,
    names: HashMap<String, u16>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object, keyed by its index and name
    ///
    /// An object already registered under the same index or name is replaced.
    pub fn add_object(&mut self, object: Object) {
        let index = object.index();
        if let Some(old) = self.objects.get(&index) {
            log::warn!(
                "Replacing object {:#06x} '{}' with '{}'",
                index,
                old.name(),
                object.name()
            );
            if self.names.get(old.name()) == Some(&index) {
                let old_name = old.name().to_string();
                self.names.remove(&old_name);
            }
        }
        if let Some(prev) = self.names.insert(object.name().to_string(), index) {
            if prev != index {
                log::warn!(
                    "Name '{}' moved from {:#06x} to {:#06x}",
                    object.name(),
                    prev,
                    index
                );
            }
        }
        self.objects.insert(index, object);
    }

    /// Get an object by index
    pub fn find_index(&self, index: u16) -> Result<&Object, ObjectError> {
        self.objects
            .get(&index)
            .context(NotFoundSnafu { index, sub: 0u8 })
    }

    /// Get an object by index, mutably
    pub fn find_index_mut(&mut self, index: u16) -> Result<&mut Object, ObjectError> {
        self.objects
            .get_mut(&index)
            .context(NotFoundSnafu { index, sub: 0u8 })
    }

    /// Get an object by name
    pub fn find_name(&self, name: &str) -> Result<&Object, ObjectError> {
        self.names
            .get(name)
            .and_then(|index| self.objects.get(index))
            .context(NameNotFoundSnafu { name })
    }

    /// Get an object by name, mutably
    pub fn find_name_mut(&mut self, name: &str) -> Result<&mut Object, ObjectError> {
        let index = *self.names.get(name).context(NameNotFoundSnafu { name })?;
        self.find_index_mut(index)
    }

    /// Get the variable at an index and sub index
    pub fn variable(&self, index: u16, sub: u8) -> Result<&Variable, ObjectError> {
        self.find_index(index)?
            .sub(sub)
            .context(NotFoundSnafu { index, sub })
    }

    /// Get the variable at an index and sub index, mutably
    pub fn variable_mut(&mut self, index: u16, sub: u8) -> Result<&mut Variable, ObjectError> {
        self.find_index_mut(index)?
            .sub_mut(sub)
            .context(NotFoundSnafu { index, sub })
    }

    /// Iterate over all objects in index order
    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// The number of top level objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if the dictionary holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Attach an SDO client to every variable
    pub fn attach_sdo(&mut self, client: &SdoClient) {
        for object in self.objects.values_mut() {
            object.attach_sdo(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use opencan_common::objects::{AccessType, DataType};

    use super::*;

    fn sample() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.add_object(Object::Variable(Variable::new(
            0x1000,
            0,
            "Device type",
            DataType::UInt32,
            AccessType::Ro,
        )));
        let mut record = Composite::new(0x1018, "Identity object");
        record.add_member(Variable::new(
            0x1018,
            0,
            "Number of entries",
            DataType::UInt8,
            AccessType::Ro,
        ));
        record.add_member(Variable::new(
            0x1018,
            1,
            "Vendor-ID",
            DataType::UInt32,
            AccessType::Ro,
        ));
        od.add_object(Object::Record(record));
        od
    }

    #[test]
    fn test_lookup() {
        let od = sample();
        assert_eq!(2, od.len());
        assert!(od.find_index(0x1000).unwrap().is_variable());
        assert_eq!(0x1018, od.find_name("Identity object").unwrap().index());
        assert_eq!("Vendor-ID", od.variable(0x1018, 1).unwrap().name);
        assert_eq!(
            1,
            od.find_index(0x1018)
                .unwrap()
                .as_composite()
                .unwrap()
                .find_name("Vendor-ID")
                .unwrap()
                .sub_index
        );
    }

    #[test]
    fn test_missing_entries() {
        let od = sample();
        assert!(matches!(
            od.find_index(0x2000),
            Err(ObjectError::NotFound { index: 0x2000, .. })
        ));
        assert!(matches!(
            od.find_name("nope"),
            Err(ObjectError::NameNotFound { .. })
        ));
        assert!(matches!(
            od.variable(0x1018, 7),
            Err(ObjectError::NotFound {
                index: 0x1018,
                sub: 7
            })
        ));
        // A variable object only answers to its own sub index
        assert!(od.variable(0x1000, 1).is_err());
    }

    #[test]
    fn test_last_writer_wins() {
        let mut od = sample();
        od.add_object(Object::Variable(Variable::new(
            0x1000,
            0,
            "Replacement",
            DataType::UInt16,
            AccessType::Rw,
        )));
        assert_eq!(2, od.len());
        assert_eq!("Replacement", od.find_index(0x1000).unwrap().name());
        assert!(od.find_name("Device type").is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let schema = sample();
        let mut copy = schema.clone();
        copy.variable_mut(0x1018, 1).unwrap().offset = 4;
        assert_eq!(0, schema.variable(0x1018, 1).unwrap().offset);
    }
}
