use opencan_common::objects::{AccessType, DataType};
use snafu::{OptionExt, ResultExt};

use super::{NoSdoClientSnafu, ObjectError, SdoSnafu, UnsupportedSnafu};
use crate::sdo_client::SdoClient;

/// A leaf entry of an object dictionary, holding one value
///
/// The raw value is kept in `data`, little endian, as transferred on the bus. It is empty until the
/// value has been read from the device, assigned a default, or filled by a PDO.
#[derive(Clone, Debug, Default)]
pub struct Variable {
    /// Object index
    pub index: u16,
    /// Sub index. 0 for a variable which is not a member of an array or record.
    pub sub_index: u8,
    /// Parameter name
    pub name: String,
    /// Free form description
    pub description: String,
    /// Declared data type
    pub data_type: DataType,
    /// Declared access type
    pub access_type: AccessType,
    /// Lowest allowed value, if declared
    pub min: Option<i64>,
    /// Highest allowed value, if declared
    pub max: Option<i64>,
    /// The default value, as written in the device description
    pub default_value: String,
    /// Raw value
    pub data: Vec<u8>,
    /// Byte offset of this value within a PDO
    pub offset: usize,
    /// Byte length of this value within a PDO
    pub size: usize,
    sdo: Option<SdoClient>,
}

impl Variable {
    /// Create a new variable with an empty value
    pub fn new(
        index: u16,
        sub_index: u8,
        name: impl Into<String>,
        data_type: DataType,
        access_type: AccessType,
    ) -> Self {
        Self {
            index,
            sub_index,
            name: name.into(),
            data_type,
            access_type,
            ..Default::default()
        }
    }

    /// Attach the SDO client used by [read](Self::read) and [write](Self::write)
    pub fn attach_sdo(&mut self, client: SdoClient) {
        self.sdo = Some(client);
    }

    /// The attached SDO client, if any
    pub fn sdo(&self) -> Option<&SdoClient> {
        self.sdo.as_ref()
    }

    /// Read the value from the device, storing it in `data`
    pub async fn read(&mut self) -> Result<&[u8], ObjectError> {
        let (index, sub) = (self.index, self.sub_index);
        let client = self.sdo.as_ref().context(NoSdoClientSnafu { index, sub })?;
        let data = client.upload(index, sub).await.context(SdoSnafu { index, sub })?;
        self.data = data;
        Ok(&self.data)
    }

    /// Write a new value to the device
    ///
    /// `data` is stored locally once the device has accepted it.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ObjectError> {
        let (index, sub) = (self.index, self.sub_index);
        let client = self.sdo.as_ref().context(NoSdoClientSnafu { index, sub })?;
        client
            .download(index, sub, data, false)
            .await
            .context(SdoSnafu { index, sub })?;
        self.data = data.to_vec();
        Ok(())
    }

    /// Write the locally held value to the device
    pub async fn save(&mut self) -> Result<(), ObjectError> {
        let data = self.data.clone();
        self.write(&data).await
    }

    /// The width of the declared type, if the buffer is large enough to hold it
    fn sized_width(&self) -> Option<usize> {
        self.data_type
            .size()
            .filter(|width| self.data.len() >= *width)
    }

    fn raw_le(&self, width: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.data[..width]);
        u64::from_le_bytes(bytes)
    }

    /// Decode the value of an unsigned integer variable
    ///
    /// Returns None if the variable is not an unsigned type, or has not been read.
    pub fn get_uint_val(&self) -> Option<u64> {
        if !self.data_type.is_unsigned() {
            return None;
        }
        let width = self.sized_width()?;
        Some(self.raw_le(width))
    }

    /// Decode the value of a signed integer variable
    ///
    /// Returns None if the variable is not a signed type, or has not been read.
    pub fn get_int_val(&self) -> Option<i64> {
        if !self.data_type.is_signed() {
            return None;
        }
        let width = self.sized_width()?;
        let raw = self.raw_le(width);
        let shift = 64 - width as u32 * 8;
        // Move the sign bit to the top, then shift back to sign extend
        Some(((raw << shift) as i64) >> shift)
    }

    /// Decode the value of a floating point variable
    ///
    /// Floating point decoding is not supported, and fails for REAL32/REAL64 variables. Other
    /// types return `Ok(None)`.
    pub fn get_float_val(&self) -> Result<Option<f64>, ObjectError> {
        if self.data_type.is_float() {
            return UnsupportedSnafu {
                what: "floating point decode",
            }
            .fail();
        }
        Ok(None)
    }

    /// Decode the value of a boolean variable
    ///
    /// Boolean decoding is not supported, and fails for BOOLEAN variables. Other types return
    /// `Ok(None)`.
    pub fn get_bool_val(&self) -> Result<Option<bool>, ObjectError> {
        if self.data_type == DataType::Boolean {
            return UnsupportedSnafu {
                what: "boolean decode",
            }
            .fail();
        }
        Ok(None)
    }

    /// Decode the value of a string variable
    ///
    /// Visible and octet strings are read as UTF-8, unicode strings as UTF-16LE. Returns None for
    /// other types.
    pub fn get_string_val(&self) -> Option<String> {
        match self.data_type {
            DataType::VisibleString | DataType::OctetString => {
                Some(String::from_utf8_lossy(&self.data).into_owned())
            }
            DataType::UnicodeString => {
                let units: Vec<u16> = self
                    .data
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Some(String::from_utf16_lossy(&units))
            }
            _ => None,
        }
    }

    /// Store an unsigned value in the local buffer
    ///
    /// Does nothing if the variable is not an unsigned type, or its buffer has not been sized.
    /// The value is truncated to the declared width.
    pub fn set_uint_val(&mut self, value: u64) {
        if !self.data_type.is_unsigned() {
            return;
        }
        if let Some(width) = self.sized_width() {
            self.data[..width].copy_from_slice(&value.to_le_bytes()[..width]);
        }
    }

    /// Store a signed value in the local buffer
    ///
    /// Does nothing if the variable is not a signed type, or its buffer has not been sized.
    pub fn set_int_val(&mut self, value: i64) {
        if !self.data_type.is_signed() {
            return;
        }
        if let Some(width) = self.sized_width() {
            self.data[..width].copy_from_slice(&value.to_le_bytes()[..width]);
        }
    }

    /// Store a floating point value. Not supported for REAL32/REAL64 variables.
    pub fn set_float_val(&mut self, _value: f64) -> Result<(), ObjectError> {
        if self.data_type.is_float() {
            return UnsupportedSnafu {
                what: "floating point encode",
            }
            .fail();
        }
        Ok(())
    }

    /// Store a boolean value. Not supported for BOOLEAN variables.
    pub fn set_bool_val(&mut self, _value: bool) -> Result<(), ObjectError> {
        if self.data_type == DataType::Boolean {
            return UnsupportedSnafu {
                what: "boolean encode",
            }
            .fail();
        }
        Ok(())
    }

    /// Store a string value. Not supported for string variables.
    pub fn set_string_val(&mut self, _value: &str) -> Result<(), ObjectError> {
        if self.data_type.is_str() {
            return UnsupportedSnafu {
                what: "string encode",
            }
            .fail();
        }
        Ok(())
    }
}
