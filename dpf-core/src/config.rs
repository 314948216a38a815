//! Client runtime configuration and server context definitions.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::{DEFAULT_FILE_CHUNK_SIZE, ENV_SERVER_CONTEXT};

/// Process-wide client options.
///
/// A single instance is shared by every session in the process, see
/// [`runtime_config`] and [`update_runtime_config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bulk transfer quantum in bytes
    pub default_file_chunk_size: u64,
    /// Memoize results of pure operator getters on the client
    pub use_cache: bool,
    /// Buffer size in bytes used for streaming connections
    pub streaming_buffer_size: u64,
    /// Send 64 bit float arrays as 32 bit floats
    pub stream_floats_instead_of_doubles: bool,
    /// Request whole arrays instead of element-wise reads for list getters
    pub return_arrays: bool,
    /// Maximum wait when acquiring a license increment
    pub license_timeout_in_seconds: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
            use_cache: false,
            streaming_buffer_size: 64 * 1024,
            stream_floats_instead_of_doubles: false,
            return_arrays: true,
            license_timeout_in_seconds: 10.0,
        }
    }
}

impl RuntimeConfig {
    /// Reads the configuration from a toml file. Missing keys take their
    /// default values.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let string = fs::read_to_string(path)?;
        Self::from_toml_str(&string)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_file_chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "default_file_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.streaming_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "streaming_buffer_size must be greater than zero".to_string(),
            ));
        }
        if !(self.license_timeout_in_seconds >= 0.) {
            return Err(Error::InvalidArgument(format!(
                "license_timeout_in_seconds must be a non-negative number, got {}",
                self.license_timeout_in_seconds
            )));
        }
        Ok(())
    }

    /// Sets an option by name from its string representation.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "default_file_chunk_size" => self.default_file_chunk_size = value.parse()?,
            "use_cache" => self.use_cache = value.parse()?,
            "streaming_buffer_size" => self.streaming_buffer_size = value.parse()?,
            "stream_floats_instead_of_doubles" => {
                self.stream_floats_instead_of_doubles = value.parse()?
            }
            "return_arrays" => self.return_arrays = value.parse()?,
            "license_timeout_in_seconds" => self.license_timeout_in_seconds = value.parse()?,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown runtime config option: {}",
                    name
                )))
            }
        }
        self.validate()
    }

    /// Lists all the options as name and string value pairs.
    pub fn options(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "default_file_chunk_size",
                self.default_file_chunk_size.to_string(),
            ),
            ("use_cache", self.use_cache.to_string()),
            ("streaming_buffer_size", self.streaming_buffer_size.to_string()),
            (
                "stream_floats_instead_of_doubles",
                self.stream_floats_instead_of_doubles.to_string(),
            ),
            ("return_arrays", self.return_arrays.to_string()),
            (
                "license_timeout_in_seconds",
                self.license_timeout_in_seconds.to_string(),
            ),
        ]
    }
}

static RUNTIME_CONFIG: Mutex<Option<RuntimeConfig>> = Mutex::new(None);

/// Returns a consistent snapshot of the process-wide runtime configuration.
pub fn runtime_config() -> RuntimeConfig {
    let mut slot = match RUNTIME_CONFIG.lock() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    slot.get_or_insert_with(RuntimeConfig::default).clone()
}

/// Mutates the process-wide runtime configuration. The change is applied
/// only if the resulting configuration is valid.
pub fn update_runtime_config<F>(f: F) -> Result<RuntimeConfig>
where
    F: FnOnce(&mut RuntimeConfig),
{
    let mut slot = match RUNTIME_CONFIG.lock() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut config = slot.clone().unwrap_or_default();
    f(&mut config);
    config.validate()?;
    debug!("runtime config updated: {:?}", config);
    *slot = Some(config.clone());
    Ok(config)
}

/// Licensing mode applied to a server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LicensingContextType {
    /// Allows using operators that require a license
    Premium,
    /// Restricts the server to operators that don't check out a license
    Entry,
}

impl fmt::Display for LicensingContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Premium => write!(f, "PREMIUM"),
            Self::Entry => write!(f, "ENTRY"),
        }
    }
}

impl FromStr for LicensingContextType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "PREMIUM" => Ok(Self::Premium),
            "ENTRY" => Ok(Self::Entry),
            _ => Err(Error::ParseError(format!(
                "unknown server context type: {} (expected PREMIUM or ENTRY)",
                s
            ))),
        }
    }
}

/// Licensing mode plus an optional plugin configuration document, applied
/// once to a server at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub licensing: LicensingContextType,
    pub xml_path: Option<PathBuf>,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self {
            licensing: LicensingContextType::Entry,
            xml_path: None,
        }
    }
}

impl ServerContext {
    pub fn new(licensing: LicensingContextType, xml_path: Option<PathBuf>) -> Self {
        Self {
            licensing,
            xml_path,
        }
    }

    pub fn premium() -> Self {
        Self::new(LicensingContextType::Premium, None)
    }

    pub fn entry() -> Self {
        Self::new(LicensingContextType::Entry, None)
    }

    /// Default context taken from the environment, falling back on `Entry`.
    pub fn from_env() -> Result<Self> {
        match env::var(ENV_SERVER_CONTEXT) {
            Ok(s) if !s.trim().is_empty() => Ok(Self::new(s.parse()?, None)),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_file_chunk_size, 524_288);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_partial() {
        let config = RuntimeConfig::from_toml_str(
            "default_file_chunk_size = 1024\nuse_cache = true\n",
        )
        .unwrap();
        assert_eq!(config.default_file_chunk_size, 1024);
        assert!(config.use_cache);
        assert!(config.return_arrays);
    }

    #[test]
    fn toml_rejects_zero_chunk() {
        assert!(RuntimeConfig::from_toml_str("default_file_chunk_size = 0").is_err());
    }

    #[test]
    fn set_option_by_name() {
        let mut config = RuntimeConfig::default();
        config.set_option("stream_floats_instead_of_doubles", "true").unwrap();
        assert!(config.stream_floats_instead_of_doubles);
        assert!(config.set_option("bogus", "1").is_err());
        assert!(config.set_option("use_cache", "maybe").is_err());
    }

    #[test]
    fn context_parsing() {
        assert_eq!(
            "premium".parse::<LicensingContextType>().unwrap(),
            LicensingContextType::Premium
        );
        assert_eq!(
            "ENTRY".parse::<LicensingContextType>().unwrap(),
            LicensingContextType::Entry
        );
        assert!("gold".parse::<LicensingContextType>().is_err());
    }
}
