//! Container configuration.
//!
//! Settings come from one or more [`ConfigSource`]s consulted in priority
//! order: environment variables with a prefix, in-memory maps and, with the
//! `config` feature, JSON files. Durations may be given as integer
//! milliseconds or as text such as `"30 seconds"`; access timeouts also accept
//! the signed convention (`0` immediate, `-1` unbounded).
//!
//! | key                       | field                            |
//! |---------------------------|----------------------------------|
//! | `access_timeout`          | `default_access_timeout`         |
//! | `pool.min` / `pool.max`   | `pool.min` / `pool.max`          |
//! | `pool.strict`             | `pool.strict`                    |
//! | `pool.max_age`            | `pool.max_age`                   |
//! | `pool.idle_timeout`       | `pool.idle_timeout`              |
//! | `session.max_active`      | `session.max_active`             |
//! | `session.timeout`         | `session.timeout`                |
//! | `shutdown.drain_timeout`  | `drain_timeout`                  |

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "config")]
use parking_lot::RwLock;
#[cfg(feature = "config")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{PoolConfig, SessionConfig};
use crate::timeout::{parse_duration, AccessTimeout, DurationParseError};

/// Configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value has the wrong type
    #[error("config key `{key}`: expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    /// A duration could not be parsed
    #[error("config key `{key}`: {source}")]
    InvalidDuration {
        key: String,
        #[source]
        source: DurationParseError,
    },
    /// The values parse but do not make a usable container
    #[error("config key `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    /// The file could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid JSON
    #[cfg(feature = "config")]
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(untagged))]
pub enum ConfigValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Object(HashMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Reads text the way environment variables are read: integers, floats and
    /// booleans are recognised, anything else stays a string.
    pub fn infer(text: &str) -> Self {
        if let Ok(int_val) = text.parse::<i64>() {
            ConfigValue::Integer(int_val)
        } else if let Ok(float_val) = text.parse::<f64>() {
            ConfigValue::Float(float_val)
        } else if let Ok(bool_val) = text.parse::<bool>() {
            ConfigValue::Boolean(bool_val)
        } else {
            ConfigValue::String(text.to_string())
        }
    }

    fn as_usize(&self, key: &str) -> Result<usize, ConfigError> {
        match self {
            ConfigValue::Integer(i) if *i >= 0 => Ok(*i as usize),
            _ => Err(mismatch(key, "a non-negative integer")),
        }
    }

    fn as_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self {
            ConfigValue::Boolean(b) => Ok(*b),
            _ => Err(mismatch(key, "a boolean")),
        }
    }

    fn as_duration(&self, key: &str) -> Result<Duration, ConfigError> {
        match self {
            ConfigValue::Integer(ms) if *ms >= 0 => Ok(Duration::from_millis(*ms as u64)),
            ConfigValue::String(text) => parse_duration(text).map_err(|source| ConfigError::InvalidDuration {
                key: key.to_string(),
                source,
            }),
            _ => Err(mismatch(key, "a duration")),
        }
    }

    fn as_access_timeout(&self, key: &str) -> Result<AccessTimeout, ConfigError> {
        match self {
            ConfigValue::Integer(ms) => Ok(AccessTimeout::from_millis(*ms)),
            ConfigValue::String(text) => text.parse().map_err(|source| ConfigError::InvalidDuration {
                key: key.to_string(),
                source,
            }),
            _ => Err(mismatch(key, "an access timeout")),
        }
    }
}

fn mismatch(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

/// A source of configuration values.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Value for a dotted key such as `pool.max`.
    fn get(&self, key: &str) -> Option<ConfigValue>;

    /// Keys this source knows about.
    fn keys(&self) -> Vec<String>;
}

/// Environment variables; `pool.max` with prefix `APP` reads `APP_POOL_MAX`.
#[derive(Debug, Default)]
pub struct EnvironmentConfigSource {
    prefix: Option<String>,
}

impl EnvironmentConfigSource {
    pub fn new() -> Self {
        Self { prefix: None }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn variable(&self, key: &str) -> String {
        let key = key.replace('.', "_").to_uppercase();
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_uppercase(), key),
            None => key,
        }
    }
}

impl ConfigSource for EnvironmentConfigSource {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        env::var(self.variable(key)).ok().map(|value| ConfigValue::infer(value.trim()))
    }

    fn keys(&self) -> Vec<String> {
        let prefix = self.prefix.as_ref().map(|p| format!("{}_", p.to_uppercase()));
        env::vars()
            .filter_map(|(key, _)| match &prefix {
                Some(prefix) => key.strip_prefix(prefix.as_str()).map(str::to_lowercase),
                None => Some(key.to_lowercase()),
            })
            .collect()
    }
}

/// In-memory key/value source.
#[derive(Debug, Default, Clone)]
pub struct MapConfigSource {
    values: HashMap<String, ConfigValue>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, builder style.
    pub fn with(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// JSON document source. Nested objects are addressed with dotted keys, so
/// `{"pool": {"max": 4}}` provides `pool.max`.
#[cfg(feature = "config")]
#[derive(Debug)]
pub struct JsonConfigSource {
    path: Option<String>,
    values: RwLock<HashMap<String, ConfigValue>>,
}

#[cfg(feature = "config")]
impl JsonConfigSource {
    /// Loads a JSON file.
    pub fn from_file(path: impl Into<String>) -> Result<Self, ConfigError> {
        let source = Self {
            path: Some(path.into()),
            values: RwLock::new(HashMap::new()),
        };
        source.reload()?;
        Ok(source)
    }

    /// Parses a JSON document held in memory.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, ConfigValue> = serde_json::from_str(json)?;
        Ok(Self {
            path: None,
            values: RwLock::new(flatten(parsed)),
        })
    }

    /// Re-reads the file; a no-op for in-memory documents.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let parsed: HashMap<String, ConfigValue> = serde_json::from_str(&content)?;
        *self.values.write() = flatten(parsed);
        Ok(())
    }
}

#[cfg(feature = "config")]
fn flatten(values: HashMap<String, ConfigValue>) -> HashMap<String, ConfigValue> {
    fn walk(prefix: &str, values: HashMap<String, ConfigValue>, out: &mut HashMap<String, ConfigValue>) {
        for (key, value) in values {
            let key = if prefix.is_empty() { key } else { format!("{}.{}", prefix, key) };
            match value {
                ConfigValue::Object(inner) => walk(&key, inner, out),
                other => {
                    out.insert(key, other);
                }
            }
        }
    }
    let mut out = HashMap::new();
    walk("", values, &mut out);
    out
}

#[cfg(feature = "config")]
impl ConfigSource for JsonConfigSource {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.read().get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

/// Sources in priority order; the first one that knows a key wins.
#[derive(Debug, Default)]
pub struct ConfigProvider {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl ConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source below the ones already added.
    pub fn add_source(&mut self, source: Box<dyn ConfigSource>) {
        self.sources.push(source);
    }

    /// Builder-style [`ConfigProvider::add_source`].
    pub fn with_source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.add_source(Box::new(source));
        self
    }

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.sources.iter().find_map(|source| source.get(key))
    }

    /// All known keys, sorted and deduplicated.
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sources.iter().flat_map(|source| source.keys()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Container-wide defaults applied where a descriptor or invocation is silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Access timeout when neither invocation, method nor component sets one
    pub default_access_timeout: AccessTimeout,
    /// Pool settings for pooled components without their own
    pub pool: PoolConfig,
    /// Session settings for session-affine components without their own
    pub session: SessionConfig,
    /// How long shutdown waits for in-flight calls before destroying instances
    pub drain_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_access_timeout: AccessTimeout::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ContainerConfig {
    /// Loads settings from a provider, falling back to defaults for missing keys.
    pub fn load(provider: &ConfigProvider) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = provider.get("access_timeout") {
            config.default_access_timeout = value.as_access_timeout("access_timeout")?;
        }
        if let Some(value) = provider.get("pool.min") {
            config.pool.min = value.as_usize("pool.min")?;
        }
        if let Some(value) = provider.get("pool.max") {
            config.pool.max = value.as_usize("pool.max")?;
        }
        if let Some(value) = provider.get("pool.strict") {
            config.pool.strict = value.as_bool("pool.strict")?;
        }
        if let Some(value) = provider.get("pool.max_age") {
            config.pool.max_age = Some(value.as_duration("pool.max_age")?);
        }
        if let Some(value) = provider.get("pool.idle_timeout") {
            config.pool.idle_timeout = Some(value.as_duration("pool.idle_timeout")?);
        }
        if let Some(value) = provider.get("session.max_active") {
            config.session.max_active = value.as_usize("session.max_active")?;
        }
        if let Some(value) = provider.get("session.timeout") {
            config.session.timeout = Some(value.as_duration("session.timeout")?);
        }
        if let Some(value) = provider.get("shutdown.drain_timeout") {
            config.drain_timeout = value.as_duration("shutdown.drain_timeout")?;
        }

        config.validate()?;
        tracing::debug!(?config, "container configuration loaded");
        Ok(config)
    }

    /// Rejects defaults no component could be deployed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |key: &'static str, reason: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid { key, reason }) };

        if self.pool.max == 0 {
            return invalid("pool.max", "must be at least 1".to_string());
        }
        if self.pool.min > self.pool.max {
            return invalid("pool.min", format!("{} exceeds pool.max {}", self.pool.min, self.pool.max));
        }
        if let (Some(age), Some(idle)) = (self.pool.max_age, self.pool.idle_timeout) {
            if idle > age {
                return invalid("pool.idle_timeout", format!("{:?} exceeds pool.max_age {:?}", idle, age));
            }
        }
        if self.session.max_active == 0 {
            return invalid("session.max_active", "must be at least 1".to_string());
        }
        Ok(())
    }

    /// Loads from environment variables under `prefix`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::load(&ConfigProvider::new().with_source(EnvironmentConfigSource::with_prefix(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn environment_source_maps_dotted_keys() {
        env::set_var("FCTEST_POOL_MAX", "4");
        env::set_var("FCTEST_POOL_STRICT", "false");
        env::set_var("FCTEST_SESSION_TIMEOUT", "2 minutes");

        let source = EnvironmentConfigSource::with_prefix("fctest");
        assert_eq!(source.get("pool.max"), Some(ConfigValue::Integer(4)));
        assert_eq!(source.get("pool.strict"), Some(ConfigValue::Boolean(false)));
        assert_eq!(source.get("session.timeout"), Some(ConfigValue::String("2 minutes".into())));
        assert!(source.keys().contains(&"pool_max".to_string()));

        env::remove_var("FCTEST_POOL_MAX");
        env::remove_var("FCTEST_POOL_STRICT");
        env::remove_var("FCTEST_SESSION_TIMEOUT");
    }

    #[test]
    fn earlier_sources_win() {
        let provider = ConfigProvider::new()
            .with_source(MapConfigSource::new().with("pool.max", ConfigValue::Integer(3)))
            .with_source(
                MapConfigSource::new()
                    .with("pool.max", ConfigValue::Integer(99))
                    .with("pool.min", ConfigValue::Integer(1)),
            );

        let config = ContainerConfig::load(&provider).unwrap();
        assert_eq!(config.pool.max, 3);
        assert_eq!(config.pool.min, 1);
        assert_eq!(provider.all_keys(), vec!["pool.max".to_string(), "pool.min".to_string()]);
    }

    #[test]
    fn access_timeout_conventions() {
        let load = |value: ConfigValue| {
            let provider = ConfigProvider::new().with_source(MapConfigSource::new().with("access_timeout", value));
            ContainerConfig::load(&provider).unwrap().default_access_timeout
        };
        assert_eq!(load(ConfigValue::Integer(0)), AccessTimeout::Immediate);
        assert_eq!(load(ConfigValue::Integer(-1)), AccessTimeout::Unbounded);
        assert_eq!(
            load(ConfigValue::String("1 minute and 30 seconds".into())),
            AccessTimeout::Bounded(Duration::from_secs(90))
        );
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let provider = ConfigProvider::new().with_source(
            MapConfigSource::new().with("session.timeout", ConfigValue::String("soon".into())),
        );
        let err = ContainerConfig::load(&provider).unwrap_err();
        assert!(err.to_string().contains("session.timeout"));

        let provider = ConfigProvider::new()
            .with_source(MapConfigSource::new().with("pool.max", ConfigValue::Integer(-2)));
        assert!(matches!(
            ContainerConfig::load(&provider),
            Err(ConfigError::TypeMismatch { expected: "a non-negative integer", .. })
        ));
    }

    #[cfg(feature = "config")]
    #[test]
    fn json_source_flattens_nested_objects() {
        let source = JsonConfigSource::parse(
            r#"{"access_timeout": "250ms", "pool": {"max": 2, "idle_timeout": 5000}, "shutdown": {"drain_timeout": "1s"}}"#,
        )
        .unwrap();
        let config = ContainerConfig::load(&ConfigProvider::new().with_source(source)).unwrap();
        assert_eq!(config.default_access_timeout, AccessTimeout::Bounded(Duration::from_millis(250)));
        assert_eq!(config.pool.max, 2);
        assert_eq!(config.pool.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.drain_timeout, Duration::from_secs(1));
    }
}
