//! Default stream settings, with environment and config file overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values passed to constructors or set on [`StreamConfig`]
//! 2. **Environment variables**: values from `BACKFLOW_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: [`StreamConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `BACKFLOW_READABLE_HWM` | `f64` | `readable_high_water_mark` |
//! | `BACKFLOW_WRITABLE_HWM` | `f64` | `writable_high_water_mark` |
//! | `BACKFLOW_TRANSFORM_READABLE_HWM` | `f64` | `transform_readable_high_water_mark` |
//! | `BACKFLOW_TRANSFORM_WRITABLE_HWM` | `f64` | `transform_writable_high_water_mark` |
//! | `BACKFLOW_BYTE_HWM` | `f64` | `byte_high_water_mark` |
//! | `BACKFLOW_DIRECT_MIN_HWM` | `f64` | `direct_min_high_water_mark` |
//! | `BACKFLOW_AUTO_ALLOCATE_CHUNK_SIZE` | `usize` | `auto_allocate_chunk_size` (0 disables) |

use crate::queue::QueuingStrategy;
use thiserror::Error;

/// Environment variable name for the readable high-water mark.
pub const ENV_READABLE_HWM: &str = "BACKFLOW_READABLE_HWM";
/// Environment variable name for the writable high-water mark.
pub const ENV_WRITABLE_HWM: &str = "BACKFLOW_WRITABLE_HWM";
/// Environment variable name for a transform's readable-side high-water mark.
pub const ENV_TRANSFORM_READABLE_HWM: &str = "BACKFLOW_TRANSFORM_READABLE_HWM";
/// Environment variable name for a transform's writable-side high-water mark.
pub const ENV_TRANSFORM_WRITABLE_HWM: &str = "BACKFLOW_TRANSFORM_WRITABLE_HWM";
/// Environment variable name for the byte stream high-water mark.
pub const ENV_BYTE_HWM: &str = "BACKFLOW_BYTE_HWM";
/// Environment variable name for the direct stream minimum high-water mark.
pub const ENV_DIRECT_MIN_HWM: &str = "BACKFLOW_DIRECT_MIN_HWM";
/// Environment variable name for the byte stream auto-allocation size.
pub const ENV_AUTO_ALLOCATE_CHUNK_SIZE: &str = "BACKFLOW_AUTO_ALLOCATE_CHUNK_SIZE";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Expected type description.
        expected: &'static str,
        /// The raw value.
        value: String,
    },
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file was not valid TOML.
    #[error("failed to parse TOML config: {0}")]
    Toml(String),
}

/// Stream defaults used when a constructor is not given explicit values.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// High-water mark of a plain readable stream.
    pub readable_high_water_mark: f64,
    /// High-water mark of a plain writable stream.
    pub writable_high_water_mark: f64,
    /// High-water mark of a transform's readable (output) side.
    pub transform_readable_high_water_mark: f64,
    /// High-water mark of a transform's writable (input) side.
    pub transform_writable_high_water_mark: f64,
    /// High-water mark, in bytes, of a byte stream.
    pub byte_high_water_mark: f64,
    /// Lower bound, in bytes, for a direct stream's high-water mark.
    pub direct_min_high_water_mark: f64,
    /// Buffer size allocated for default reads on byte streams.
    pub auto_allocate_chunk_size: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            readable_high_water_mark: 1.0,
            writable_high_water_mark: 1.0,
            transform_readable_high_water_mark: 0.0,
            transform_writable_high_water_mark: 1.0,
            byte_high_water_mark: 0.0,
            direct_min_high_water_mark: 64.0,
            auto_allocate_chunk_size: None,
        }
    }
}

impl StreamConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config.normalize())
    }

    /// Count strategy at the readable high-water mark.
    #[must_use]
    pub fn readable_strategy<T>(&self) -> QueuingStrategy<T> {
        QueuingStrategy::new(self.readable_high_water_mark)
    }

    /// Count strategy at the writable high-water mark.
    #[must_use]
    pub fn writable_strategy<T>(&self) -> QueuingStrategy<T> {
        QueuingStrategy::new(self.writable_high_water_mark)
    }

    /// Replaces unusable values with their defaults.
    ///
    /// High-water marks must be non-negative numbers; an auto-allocation
    /// size of zero means "disabled".
    #[must_use]
    pub fn normalize(mut self) -> Self {
        let defaults = Self::default();
        let fix = |value: &mut f64, default: f64| {
            if value.is_nan() || *value < 0.0 {
                *value = default;
            }
        };
        fix(
            &mut self.readable_high_water_mark,
            defaults.readable_high_water_mark,
        );
        fix(
            &mut self.writable_high_water_mark,
            defaults.writable_high_water_mark,
        );
        fix(
            &mut self.transform_readable_high_water_mark,
            defaults.transform_readable_high_water_mark,
        );
        fix(
            &mut self.transform_writable_high_water_mark,
            defaults.transform_writable_high_water_mark,
        );
        fix(&mut self.byte_high_water_mark, defaults.byte_high_water_mark);
        fix(
            &mut self.direct_min_high_water_mark,
            defaults.direct_min_high_water_mark,
        );
        if self.auto_allocate_chunk_size == Some(0) {
            self.auto_allocate_chunk_size = None;
        }
        self
    }
}

/// Apply environment variable overrides to a [`StreamConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut StreamConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_READABLE_HWM) {
        config.readable_high_water_mark = parse_f64(ENV_READABLE_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_WRITABLE_HWM) {
        config.writable_high_water_mark = parse_f64(ENV_WRITABLE_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_TRANSFORM_READABLE_HWM) {
        config.transform_readable_high_water_mark = parse_f64(ENV_TRANSFORM_READABLE_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_TRANSFORM_WRITABLE_HWM) {
        config.transform_writable_high_water_mark = parse_f64(ENV_TRANSFORM_WRITABLE_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_BYTE_HWM) {
        config.byte_high_water_mark = parse_f64(ENV_BYTE_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_DIRECT_MIN_HWM) {
        config.direct_min_high_water_mark = parse_f64(ENV_DIRECT_MIN_HWM, &val)?;
    }
    if let Some(val) = read_env(ENV_AUTO_ALLOCATE_CHUNK_SIZE) {
        let size = parse_usize(ENV_AUTO_ALLOCATE_CHUNK_SIZE, &val)?;
        config.auto_allocate_chunk_size = (size > 0).then_some(size);
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_f64(var: &'static str, val: &str) -> Result<f64, ConfigError> {
    match val.trim().parse::<f64>() {
        Ok(parsed) if !parsed.is_nan() && parsed >= 0.0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue {
            var,
            expected: "non-negative number",
            value: val.to_owned(),
        }),
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_owned(),
        })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable stream configuration.
///
/// ```toml
/// [readable]
/// high_water_mark = 4
///
/// [writable]
/// high_water_mark = 16
///
/// [transform]
/// readable_high_water_mark = 0
/// writable_high_water_mark = 1
///
/// [bytes]
/// high_water_mark = 65536
/// direct_min_high_water_mark = 64
/// auto_allocate_chunk_size = 4096
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct StreamTomlConfig {
    /// Readable stream settings.
    #[serde(default)]
    pub readable: SideToml,
    /// Writable stream settings.
    #[serde(default)]
    pub writable: SideToml,
    /// Transform settings.
    #[serde(default)]
    pub transform: TransformToml,
    /// Byte and direct stream settings.
    #[serde(default)]
    pub bytes: BytesToml,
}

/// One side's TOML section.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct SideToml {
    /// High-water mark.
    pub high_water_mark: Option<f64>,
}

/// Transform section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TransformToml {
    /// Output side high-water mark.
    pub readable_high_water_mark: Option<f64>,
    /// Input side high-water mark.
    pub writable_high_water_mark: Option<f64>,
}

/// Byte stream section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct BytesToml {
    /// Byte stream high-water mark.
    pub high_water_mark: Option<f64>,
    /// Direct stream minimum high-water mark.
    pub direct_min_high_water_mark: Option<f64>,
    /// Auto-allocation size for default reads.
    pub auto_allocate_chunk_size: Option<usize>,
}

/// Apply a parsed TOML config to a [`StreamConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut StreamConfig, toml: &StreamTomlConfig) {
    if let Some(v) = toml.readable.high_water_mark {
        config.readable_high_water_mark = v;
    }
    if let Some(v) = toml.writable.high_water_mark {
        config.writable_high_water_mark = v;
    }
    if let Some(v) = toml.transform.readable_high_water_mark {
        config.transform_readable_high_water_mark = v;
    }
    if let Some(v) = toml.transform.writable_high_water_mark {
        config.transform_writable_high_water_mark = v;
    }
    if let Some(v) = toml.bytes.high_water_mark {
        config.byte_high_water_mark = v;
    }
    if let Some(v) = toml.bytes.direct_min_high_water_mark {
        config.direct_min_high_water_mark = v;
    }
    if let Some(v) = toml.bytes.auto_allocate_chunk_size {
        config.auto_allocate_chunk_size = Some(v);
    }
}

/// Parse a TOML string into a [`StreamTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<StreamTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::Toml(e.to_string()))
}

/// Read and parse a TOML file into a [`StreamTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<StreamTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_toml_str(&content)
}

#[cfg(feature = "config-file")]
impl StreamConfig {
    /// Defaults, then the TOML file at `path`, then environment overrides.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_toml_config(&mut config, &parse_toml_file(path)?);
        apply_env_overrides(&mut config)?;
        Ok(config.normalize())
    }
}
