//! Object Definitions
//!

/// Object Code value
///
/// Defines the type of an object or sub object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    /// An empty object
    Null = 0,
    /// A large chunk of data
    Domain = 2,
    /// Unused
    DefType = 5,
    /// Unused
    DefStruct = 6,
    /// An object which has a single sub object
    #[default]
    Var = 7,
    /// An array of sub-objects all with the same data type
    Array = 8,
    /// A collection of sub-objects with varying types
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// Access type enum
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }

    /// Parse the access type strings used in device description files
    ///
    /// `rwr` and `rww` (read-write, mapped for TPDO/RPDO) are treated as read-write.
    pub fn from_eds_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ro" => Some(AccessType::Ro),
            "wo" => Some(AccessType::Wo),
            "rw" | "rwr" | "rww" => Some(AccessType::Rw),
            "const" => Some(AccessType::Const),
            _ => None,
        }
    }
}

/// Indicate the type of data stored in an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean,
    #[default]
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    Real64,
    VisibleString,
    OctetString,
    UnicodeString,
    Domain,
    Other(u16),
}

impl From<u16> for DataType {
    fn from(value: u16) -> Self {
        use DataType::*;
        match value {
            1 => Boolean,
            2 => Int8,
            3 => Int16,
            4 => Int32,
            5 => UInt8,
            6 => UInt16,
            7 => UInt32,
            8 => Real32,
            9 => VisibleString,
            0xa => OctetString,
            0xb => UnicodeString,
            0xf => Domain,
            0x11 => Real64,
            0x15 => Int64,
            0x1b => UInt64,
            _ => Other(value),
        }
    }
}

impl From<DataType> for u16 {
    fn from(value: DataType) -> Self {
        use DataType::*;
        match value {
            Boolean => 1,
            Int8 => 2,
            Int16 => 3,
            Int32 => 4,
            UInt8 => 5,
            UInt16 => 6,
            UInt32 => 7,
            Real32 => 8,
            VisibleString => 9,
            OctetString => 0xa,
            UnicodeString => 0xb,
            Domain => 0xf,
            Real64 => 0x11,
            Int64 => 0x15,
            UInt64 => 0x1b,
            Other(v) => v,
        }
    }
}

impl DataType {
    /// Returns true if data type is one of the signed integer types
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// Returns true if data type is one of the unsigned integer types
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64
        )
    }

    /// Returns true if data type is one of the floating point types
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Real32 | Self::Real64)
    }

    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }

    /// The encoded size in bytes of fixed width types
    ///
    /// Returns None for strings, domains and unknown types.
    pub fn size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            Int64 | UInt64 | Real64 => Some(8),
            _ => None,
        }
    }
}
