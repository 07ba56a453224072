use std::{path::Path, time::Duration};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Error returned when loading client configuration files
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// Path of the file
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML, or does not match the expected layout
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// Underlying error
        source: toml::de::Error,
    },
}

/// Runtime tunables for the client
///
/// Every section and field is optional in the TOML representation; missing values take their
/// defaults.
///
/// ```toml
/// [sdo]
/// timeout_ms = 300
/// retries = 3
///
/// [bus]
/// channel_capacity = 100
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// SDO client settings
    pub sdo: SdoSettings,
    /// Frame bus settings
    pub bus: BusSettings,
    /// NMT master settings
    pub nmt: NmtSettings,
    /// PDO settings
    pub pdo: PdoSettings,
}

impl ClientConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<ClientConfig, ConfigError> {
        toml::from_str(s).context(TomlDeserializationSnafu)
    }
}

/// SDO request timing
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SdoSettings {
    /// Time to wait for the first response to a request. Doubled on each retry.
    pub timeout_ms: u64,
    /// Number of times a request is sent before giving up
    pub retries: u32,
}

impl Default for SdoSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 300,
            retries: 3,
        }
    }
}

impl SdoSettings {
    /// The initial response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Frame bus channel sizes
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BusSettings {
    /// Depth of each subscriber channel. Frames arriving at a full channel are dropped.
    pub channel_capacity: usize,
    /// Depth of the receive error channel
    pub error_channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            error_channel_capacity: 16,
        }
    }
}

/// NMT master timing
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NmtSettings {
    /// Default time to wait for a node to report operational
    pub bootup_timeout_ms: u64,
    /// How often the heartbeat state is checked while waiting for bootup
    pub poll_interval_ms: u64,
}

impl Default for NmtSettings {
    fn default() -> Self {
        Self {
            bootup_timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl NmtSettings {
    /// Default time to wait for a node to report operational
    pub fn bootup_timeout(&self) -> Duration {
        Duration::from_millis(self.bootup_timeout_ms)
    }

    /// Bootup polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// PDO settings
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PdoSettings {
    /// Depth of each change notification channel
    pub change_channel_capacity: usize,
}

impl Default for PdoSettings {
    fn default() -> Self {
        Self {
            change_channel_capacity: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config = ClientConfig::load_from_str(
            r#"
            [sdo]
            timeout_ms = 100

            [nmt]
            poll_interval_ms = 20
            "#,
        )
        .unwrap();

        assert_eq!(100, config.sdo.timeout_ms);
        assert_eq!(3, config.sdo.retries);
        assert_eq!(Duration::from_millis(20), config.nmt.poll_interval());
        assert_eq!(BusSettings::default(), config.bus);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(ClientConfig::default(), ClientConfig::load_from_str("").unwrap());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = ClientConfig::load_from_str("[sdo]\ntimeout = 5\n");
        assert!(matches!(
            result,
            Err(ConfigError::TomlDeserialization { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load_from_file("/nonexistent/opencan.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
