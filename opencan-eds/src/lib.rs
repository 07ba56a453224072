//! Load an [ObjectDictionary] from a CANopen electronic data sheet
//!
//! EDS files are INI files. Each top level object is described by a section named by its hex index
//! (e.g. `[1018]`), and each member of an array or record by a section named `[1018sub1]`. Only the
//! fields needed to talk to a device are read: the name, object type, data type, access type,
//! limits and default value. Device commissioning (`[DeviceComissioning]`) supplies the node ID and
//! bit rate.
//!
//! ```no_run
//! let schema = opencan_eds::load_eds("device.eds").unwrap();
//! println!("{} objects", schema.len());
//! ```
use std::{collections::HashMap, num::ParseIntError, path::Path};

use configparser::ini::Ini;
use snafu::{ResultExt as _, Snafu};

use opencan_client::object_dict::{Composite, Object, ObjectDictionary, Variable};
use opencan_common::objects::{AccessType, DataType, ObjectCode};

/// Highest data type index defined by the standard. Larger values name a type definition object.
const MAX_STANDARD_DATA_TYPE: u32 = 0x1B;

/// Errors loading an EDS file
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// The file is not valid INI, or could not be read
    #[snafu(display("Invalid INI: {message}"))]
    IniFormat {
        /// Message from the INI parser
        message: String,
    },
    /// The file is valid INI but not a valid EDS
    #[snafu(display("Invalid EDS: {message}"))]
    EdsFormat {
        /// What was wrong
        message: String,
    },
    /// A numeric field could not be parsed
    #[snafu(display("{message}: {source}"))]
    ParseInt {
        /// Which field was being parsed
        message: String,
        /// Underlying error
        source: ParseIntError,
    },
}

type IniMap = HashMap<String, HashMap<String, Option<String>>>;

/// Parse an integer as written in an EDS file: decimal, or hex with a `0x` prefix
fn parse_int(s: &str) -> Result<i128, ParseIntError> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16)?,
        None => digits.parse::<i128>()?,
    };
    Ok(if negative { -value } else { value })
}

struct Section<'a> {
    map: &'a HashMap<String, Option<String>>,
    section: String,
}

impl<'a> Section<'a> {
    fn from_map(map: &'a IniMap, section: &str) -> Option<Self> {
        map.get(&section.to_lowercase()).map(|map| Self {
            map,
            section: section.to_string(),
        })
    }

    /// Get a field's value. Missing and empty fields both read as None.
    fn get(&self, field: &str) -> Option<&'a str> {
        self.map
            .get(&field.to_lowercase())
            .and_then(|value| value.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn get_string(&self, field: &str) -> String {
        self.get(field).unwrap_or_default().to_string()
    }

    fn require(&self, field: &str) -> Result<&'a str, LoadError> {
        self.get(field).ok_or_else(|| {
            EdsFormatSnafu {
                message: format!("Missing required field '{}' in '{}'", field, self.section),
            }
            .build()
        })
    }

    fn parse_field(&self, field: &str, value: &str) -> Result<i128, LoadError> {
        parse_int(value).context(ParseIntSnafu {
            message: format!("Parsing '{}' in section '{}'", field, self.section),
        })
    }

    fn get_int(&self, field: &str) -> Result<i128, LoadError> {
        let value = self.require(field)?;
        self.parse_field(field, value)
    }

    fn get_int_opt(&self, field: &str) -> Result<Option<i128>, LoadError> {
        self.get(field)
            .map(|value| self.parse_field(field, value))
            .transpose()
    }
}

/// What kind of section a name refers to
enum SectionName {
    Object(u16),
    Sub(u16, u8),
}

impl SectionName {
    fn parse(name: &str) -> Option<Self> {
        let is_index = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit());
        if is_index(name) {
            return u16::from_str_radix(name, 16).ok().map(Self::Object);
        }
        let (index, sub) = name.split_once("sub")?;
        if !is_index(index) || sub.is_empty() || !sub.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self::Sub(
            u16::from_str_radix(index, 16).ok()?,
            u8::from_str_radix(sub, 16).ok()?,
        ))
    }
}

/// Resolve a data type, following user defined types to the standard type they are based on
fn resolve_data_type(map: &IniMap, section: &Section, raw: i128) -> Result<DataType, LoadError> {
    let raw = u32::try_from(raw).map_err(|_| {
        EdsFormatSnafu {
            message: format!("Invalid DataType {} in '{}'", raw, section.section),
        }
        .build()
    })?;
    if raw <= MAX_STANDARD_DATA_TYPE {
        return Ok(DataType::from(raw as u16));
    }
    let def_name = format!("{:04x}sub1", raw);
    let definition = Section::from_map(map, &def_name).ok_or_else(|| {
        EdsFormatSnafu {
            message: format!(
                "Data type {:#06x} used in '{}' has no definition section '{}'",
                raw, section.section, def_name
            ),
        }
        .build()
    })?;
    let base = definition.get_int("DefaultValue")?;
    log::debug!(
        "Resolved data type {:#06x} in '{}' to {:#06x}",
        raw,
        section.section,
        base
    );
    Ok(DataType::from(base as u16))
}

/// Encode a numeric default into a value buffer, if the type has a fixed width
fn default_data(data_type: DataType, default_value: &str) -> Vec<u8> {
    let Some(width) = data_type.size() else {
        return Vec::new();
    };
    if !(data_type.is_signed() || data_type.is_unsigned()) {
        return Vec::new();
    }
    match parse_int(default_value) {
        Ok(value) => (value as i64).to_le_bytes()[..width].to_vec(),
        // Defaults such as `$NODEID+0x180` depend on the node, and are left for the device to report
        Err(_) => Vec::new(),
    }
}

fn build_variable(
    map: &IniMap,
    section: &Section,
    index: u16,
    sub_index: u8,
) -> Result<Variable, LoadError> {
    let data_type = resolve_data_type(map, section, section.get_int("DataType")?)?;
    let access_type = match section.get("AccessType") {
        Some(value) => AccessType::from_eds_str(value).ok_or_else(|| {
            EdsFormatSnafu {
                message: format!("Invalid AccessType '{}' in '{}'", value, section.section),
            }
            .build()
        })?,
        None => AccessType::default(),
    };
    let clamp = |value: i128| value.clamp(i64::MIN as i128, i64::MAX as i128) as i64;

    let mut variable = Variable::new(
        index,
        sub_index,
        section.get_string("ParameterName"),
        data_type,
        access_type,
    );
    variable.description = section.get_string("Description");
    variable.min = section.get_int_opt("LowLimit")?.map(clamp);
    variable.max = section.get_int_opt("HighLimit")?.map(clamp);
    variable.default_value = section.get_string("DefaultValue");
    variable.data = default_data(data_type, &variable.default_value);
    Ok(variable)
}

/// Build a dictionary from a parsed INI map
fn from_config_map(map: &IniMap) -> Result<ObjectDictionary, LoadError> {
    let mut dictionary = ObjectDictionary::new();

    if let Some(commissioning) = Section::from_map(map, "DeviceComissioning") {
        if let Some(node_id) = commissioning.get_int_opt("NodeId")? {
            dictionary.node_id = node_id as u8;
        }
        if let Some(baud_rate) = commissioning.get_int_opt("Baudrate")? {
            dictionary.baud_rate = baud_rate as u32;
        }
    }

    let mut objects = Vec::new();
    let mut subs = Vec::new();
    for name in map.keys() {
        match SectionName::parse(name) {
            Some(SectionName::Object(index)) => objects.push((index, name.as_str())),
            Some(SectionName::Sub(index, sub)) => subs.push((index, sub, name.as_str())),
            None => (),
        }
    }
    // Map iteration order is arbitrary, so sort for repeatable results
    objects.sort_unstable();
    subs.sort_unstable();

    for (index, name) in objects {
        let Some(section) = Section::from_map(map, name) else {
            continue;
        };
        let object_type = section.get_int("ObjectType")?;
        let object_name = section.get_string("ParameterName");
        let object = match u8::try_from(object_type).ok().map(ObjectCode::try_from) {
            Some(Ok(ObjectCode::Var)) => {
                Object::Variable(build_variable(map, &section, index, 0)?)
            }
            Some(Ok(ObjectCode::Array)) => Object::Array(Composite::new(index, object_name)),
            Some(Ok(ObjectCode::Record)) => Object::Record(Composite::new(index, object_name)),
            _ => {
                log::debug!("Skipping '{}' with object type {:#x}", name, object_type);
                continue;
            }
        };
        dictionary.add_object(object);
    }

    for (index, sub, name) in subs {
        let Some(section) = Section::from_map(map, name) else {
            continue;
        };
        let variable = build_variable(map, &section, index, sub)?;
        let parent = dictionary.find_index_mut(index).map_err(|_| {
            EdsFormatSnafu {
                message: format!("Section '{}' has no parent object {:04X}", name, index),
            }
            .build()
        })?;
        match parent.as_composite_mut() {
            Some(composite) => composite.add_member(variable),
            None => log::warn!(
                "Ignoring '{}': object {:04X} is not an array or record",
                name,
                index
            ),
        }
    }

    Ok(dictionary)
}

/// Parse EDS text into an object dictionary
pub fn parse_eds(eds: &str) -> Result<ObjectDictionary, LoadError> {
    let mut config = Ini::new();
    let map = config
        .read(eds.to_string())
        .map_err(|message| IniFormatSnafu { message }.build())?;
    from_config_map(&map)
}

/// Load an EDS file into an object dictionary
pub fn load_eds<P: AsRef<Path>>(path: P) -> Result<ObjectDictionary, LoadError> {
    let mut config = Ini::new();
    let map = config
        .load(path)
        .map_err(|message| IniFormatSnafu { message }.build())?;
    from_config_map(&map)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const EDS: &str = include_str!("example.eds");

    #[test]
    fn test_parse_int() {
        assert_eq!(0x1A, parse_int("0x1A").unwrap());
        assert_eq!(0x1A, parse_int("0X1a").unwrap());
        assert_eq!(-400, parse_int("-400").unwrap());
        assert_eq!(10, parse_int(" 10 ").unwrap());
        assert!(parse_int("$NODEID+0x180").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut eds_file = tempfile::NamedTempFile::new().unwrap();
        eds_file.write_all(EDS.as_bytes()).unwrap();

        let od = load_eds(eds_file.path()).unwrap();
        assert_eq!(10, od.node_id);
        assert_eq!(500, od.baud_rate);
        assert!(od.find_name("Device Type").is_ok());
    }

    #[test]
    fn test_variables() {
        let od = parse_eds(EDS).unwrap();

        let device_type = od.variable(0x1000, 0).unwrap();
        assert_eq!("Device Type", device_type.name);
        assert_eq!(DataType::UInt32, device_type.data_type);
        assert_eq!(AccessType::Ro, device_type.access_type);
        assert_eq!(None, device_type.min);
        assert_eq!(Some(0x191), device_type.get_uint_val());

        let mode = od.variable(0x6100, 0).unwrap();
        assert_eq!(AccessType::Rw, mode.access_type);
        assert_eq!(Some(3), mode.get_uint_val());
    }

    #[test]
    fn test_composites() {
        let od = parse_eds(EDS).unwrap();

        let identity = od.find_index(0x1018).unwrap();
        assert_eq!(ObjectCode::Record, identity.object_code());
        assert_eq!(2, identity.as_composite().unwrap().len());
        let entries = od.variable(0x1018, 0).unwrap();
        assert_eq!(Some(1), entries.min);
        assert_eq!(Some(4), entries.max);
        assert_eq!(Some(0x0200_005A), od.variable(0x1018, 1).unwrap().get_uint_val());

        let inputs = od.find_name("Inputs").unwrap();
        assert_eq!(ObjectCode::Array, inputs.object_code());
        assert_eq!(
            "Temperature",
            inputs.as_composite().unwrap().find_index(1).unwrap().name
        );
    }

    #[test]
    fn test_user_defined_type() {
        let od = parse_eds(EDS).unwrap();
        let temperature = od.variable(0x6000, 1).unwrap();
        assert_eq!(DataType::Int16, temperature.data_type);
        assert_eq!(Some(-400), temperature.min);
        assert_eq!(Some(2000), temperature.max);
        assert_eq!(Some(-25), temperature.get_int_val());
    }

    #[test]
    fn test_non_numeric_defaults() {
        let od = parse_eds(EDS).unwrap();

        let cob_id = od.variable(0x1800, 1).unwrap();
        assert_eq!("$NODEID+0x180", cob_id.default_value);
        assert!(cob_id.data.is_empty());

        let label = od.variable(0x6000, 2).unwrap();
        assert_eq!(DataType::VisibleString, label.data_type);
        assert_eq!("probe", label.default_value);
        assert!(label.data.is_empty());
    }

    #[test]
    fn test_missing_parent() {
        let eds = "[2000sub1]\nParameterName=Orphan\nDataType=0x0007\nAccessType=rw\n";
        assert!(matches!(
            parse_eds(eds),
            Err(LoadError::EdsFormat { .. })
        ));
    }

    #[test]
    fn test_bad_fields() {
        let eds = "[2000]\nParameterName=Bad\nObjectType=0x7\nDataType=seven\nAccessType=rw\n";
        assert!(matches!(parse_eds(eds), Err(LoadError::ParseInt { .. })));

        let eds = "[2000]\nParameterName=Bad\nObjectType=0x7\nDataType=0x0007\nAccessType=rx\n";
        assert!(matches!(parse_eds(eds), Err(LoadError::EdsFormat { .. })));

        let eds = "[2000]\nParameterName=Bad\nObjectType=0x7\nDataType=0x0040\nAccessType=rw\n";
        assert!(matches!(parse_eds(eds), Err(LoadError::EdsFormat { .. })));
    }
}
