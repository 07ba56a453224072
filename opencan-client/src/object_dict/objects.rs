use std::collections::{BTreeMap, HashMap};

use opencan_common::objects::ObjectCode;

use super::Variable;
use crate::sdo_client::SdoClient;

/// An array or record object: a set of [Variable] members addressed by sub index or name
#[derive(Clone, Debug, Default)]
pub struct Composite {
    /// Object index
    pub index: u16,
    /// Parameter name
    pub name: String,
    /// Free form description
    pub description: String,
    members: BTreeMap<u8, Variable>,
    names: HashMap<String, u8>,
}

impl Composite {
    /// Create an empty composite
    pub fn new(index: u16, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a member, keyed by its sub index and name
    ///
    /// A member already registered under the same sub index or name is replaced.
    pub fn add_member(&mut self, member: Variable) {
        let sub = member.sub_index;
        if let Some(old) = self.members.get(&sub) {
            log::warn!(
                "Replacing {:#06x}sub{} '{}' with '{}'",
                self.index,
                sub,
                old.name,
                member.name
            );
            if self.names.get(&old.name) == Some(&sub) {
                let old_name = old.name.clone();
                self.names.remove(&old_name);
            }
        }
        if let Some(prev) = self.names.insert(member.name.clone(), sub) {
            if prev != sub {
                log::warn!(
                    "Name '{}' in {:#06x} moved from sub {} to sub {}",
                    member.name,
                    self.index,
                    prev,
                    sub
                );
            }
        }
        self.members.insert(sub, member);
    }

    /// Get a member by sub index
    pub fn find_index(&self, sub: u8) -> Option<&Variable> {
        self.members.get(&sub)
    }

    /// Get a member by sub index, mutably
    pub fn find_index_mut(&mut self, sub: u8) -> Option<&mut Variable> {
        self.members.get_mut(&sub)
    }

    /// Get a member by name
    pub fn find_name(&self, name: &str) -> Option<&Variable> {
        self.names.get(name).and_then(|sub| self.members.get(sub))
    }

    /// Get a member by name, mutably
    pub fn find_name_mut(&mut self, name: &str) -> Option<&mut Variable> {
        let sub = *self.names.get(name)?;
        self.members.get_mut(&sub)
    }

    /// Iterate over the members in sub index order
    pub fn members(&self) -> impl Iterator<Item = &Variable> {
        self.members.values()
    }

    /// Iterate mutably over the members in sub index order
    pub fn members_mut(&mut self) -> impl Iterator<Item = &mut Variable> {
        self.members.values_mut()
    }

    /// The number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if there are no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A top level object dictionary entry
#[derive(Clone, Debug)]
pub enum Object {
    /// A single value
    Variable(Variable),
    /// Members sharing one data type
    Array(Composite),
    /// Members with individual data types
    Record(Composite),
}

impl Object {
    /// The object index
    pub fn index(&self) -> u16 {
        match self {
            Object::Variable(v) => v.index,
            Object::Array(c) | Object::Record(c) => c.index,
        }
    }

    /// The object name
    pub fn name(&self) -> &str {
        match self {
            Object::Variable(v) => &v.name,
            Object::Array(c) | Object::Record(c) => &c.name,
        }
    }

    /// The object code
    pub fn object_code(&self) -> ObjectCode {
        match self {
            Object::Variable(_) => ObjectCode::Var,
            Object::Array(_) => ObjectCode::Array,
            Object::Record(_) => ObjectCode::Record,
        }
    }

    /// True if this object is a single value
    pub fn is_variable(&self) -> bool {
        matches!(self, Object::Variable(_))
    }

    /// Access the value of a variable object
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Object::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Access the value of a variable object, mutably
    pub fn as_variable_mut(&mut self) -> Option<&mut Variable> {
        match self {
            Object::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Access the members of an array or record
    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Object::Array(c) | Object::Record(c) => Some(c),
            Object::Variable(_) => None,
        }
    }

    /// Access the members of an array or record, mutably
    pub fn as_composite_mut(&mut self) -> Option<&mut Composite> {
        match self {
            Object::Array(c) | Object::Record(c) => Some(c),
            Object::Variable(_) => None,
        }
    }

    /// Get the variable at `sub`
    ///
    /// For a variable object, only its own sub index matches.
    pub fn sub(&self, sub: u8) -> Option<&Variable> {
        match self {
            Object::Variable(v) => (v.sub_index == sub).then_some(v),
            Object::Array(c) | Object::Record(c) => c.find_index(sub),
        }
    }

    /// Get the variable at `sub`, mutably
    pub fn sub_mut(&mut self, sub: u8) -> Option<&mut Variable> {
        match self {
            Object::Variable(v) => (v.sub_index == sub).then_some(v),
            Object::Array(c) | Object::Record(c) => c.find_index_mut(sub),
        }
    }

    /// Attach an SDO client to every variable in this object
    pub fn attach_sdo(&mut self, client: &SdoClient) {
        match self {
            Object::Variable(v) => v.attach_sdo(client.clone()),
            Object::Array(c) | Object::Record(c) => {
                for member in c.members_mut() {
                    member.attach_sdo(client.clone());
                }
            }
        }
    }
}
