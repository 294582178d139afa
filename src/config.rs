use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_yaml::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration")]
    Parse(#[source] serde_yaml::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Read-only dotted-path lookup over the raw configuration tree.
///
/// `null` values are treated the same as missing keys so that an empty
/// YAML entry falls back to its default.
#[derive(Debug, Clone)]
pub struct ConfigView {
    root: Value,
}

impl ConfigView {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map(Self::new)
            .map_err(ConfigError::Parse)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for name in path.split('.') {
            current = current.as_mapping()?.get(name)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// Scalar values are rendered as strings, so `apikey: 1234` still works.
    pub fn str_or(&self, path: &str, default: &str) -> String {
        self.scalar(path).unwrap_or_else(|| default.to_string())
    }

    pub fn optional_str(&self, path: &str) -> Option<String> {
        self.scalar(path).filter(|v| !v.is_empty())
    }

    pub fn required_str(&self, path: &'static str) -> Result<String, ConfigError> {
        self.optional_str(path).ok_or(ConfigError::Missing(path))
    }

    pub fn bool_or(&self, path: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(path) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(ConfigError::Invalid {
                key: path,
                reason: format!("expected a boolean, got {other:?}"),
            }),
        }
    }

    pub fn u64_or(&self, path: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.get(path) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| ConfigError::Invalid {
                key: path,
                reason: format!("expected a non-negative integer, got {value:?}"),
            }),
        }
    }

    /// Entries of a mapping section as `(key, scalar)` pairs.
    pub fn entries(&self, path: &str) -> BTreeMap<String, String> {
        let Some(mapping) = self.get(path).and_then(Value::as_mapping) else {
            return BTreeMap::new();
        };
        mapping
            .iter()
            .filter_map(|(k, v)| Some((scalar_to_string(k)?, scalar_to_string(v)?)))
            .collect()
    }

    fn scalar(&self, path: &str) -> Option<String> {
        self.get(path).and_then(scalar_to_string)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub deconz: DeconzConfig,
    pub mqtt: MqttConfig,
    /// Logger target → level, as written in the file.
    pub logging: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DeconzConfig {
    pub uri: String,
    pub apikey: String,
    pub discovery_ttl: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub client: MqttClientConfig,
    pub topic_prefix: String,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub uri: String,
    pub clean_session: bool,
    pub client_id: String,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_view(&ConfigView::parse(&content)?)
    }

    pub fn from_view(view: &ConfigView) -> Result<Self, ConfigError> {
        let config = Self {
            deconz: DeconzConfig {
                uri: view
                    .required_str("deconz.uri")?
                    .trim_end_matches('/')
                    .to_string(),
                apikey: view.required_str("deconz.apikey")?,
                discovery_ttl: Duration::from_secs(view.u64_or("deconz.discovery_ttl", 600)?),
                request_timeout: Duration::from_secs(view.u64_or("deconz.request_timeout", 10)?),
            },
            mqtt: MqttConfig {
                client: MqttClientConfig {
                    uri: view.required_str("mqtt.client.uri")?,
                    clean_session: view.bool_or("mqtt.client.cleansession", true)?,
                    client_id: view.str_or("mqtt.client.client_id", "mqtt2deconz"),
                    keep_alive: Duration::from_secs(view.u64_or("mqtt.client.keep_alive", 30)?),
                    username: view.optional_str("mqtt.client.username"),
                    password: view.optional_str("mqtt.client.password"),
                },
                topic_prefix: view
                    .str_or("mqtt.topic_prefix", "deconz")
                    .trim_end_matches('/')
                    .to_string(),
                idle_timeout: Duration::from_secs(view.u64_or("mqtt.idle_timeout", 180)?),
                queue_capacity: usize::try_from(view.u64_or("mqtt.queue_capacity", 10)?)
                    .map_err(|e| ConfigError::Invalid {
                        key: "mqtt.queue_capacity",
                        reason: e.to_string(),
                    })?,
            },
            logging: view.entries("logging"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.deconz.request_timeout.is_zero() {
            return Err(invalid("deconz.request_timeout", "must be > 0"));
        }
        if self.mqtt.idle_timeout.is_zero() {
            return Err(invalid("mqtt.idle_timeout", "must be > 0"));
        }
        if self.mqtt.queue_capacity == 0 {
            return Err(invalid("mqtt.queue_capacity", "must be > 0"));
        }
        if self.mqtt.topic_prefix.is_empty() {
            return Err(invalid("mqtt.topic_prefix", "must not be empty"));
        }
        let keep_alive = self.mqtt.client.keep_alive;
        if !keep_alive.is_zero() && keep_alive < Duration::from_secs(5) {
            return Err(invalid(
                "mqtt.client.keep_alive",
                "must be 0 or at least 5 seconds",
            ));
        }
        if self.mqtt.client.client_id.is_empty() && !self.mqtt.client.clean_session {
            return Err(invalid(
                "mqtt.client.client_id",
                "must be set when cleansession is false",
            ));
        }
        // Carried verbatim in the broker URL query string.
        if !self
            .mqtt
            .client
            .client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._~".contains(c))
        {
            return Err(invalid(
                "mqtt.client.client_id",
                "may only contain ASCII letters, digits, '-', '.', '_' and '~'",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

impl MqttClientConfig {
    /// Broker URL in the form `rumqttc` expects, which carries the client id
    /// as a query parameter.
    pub fn broker_url(&self) -> String {
        if self.uri.contains("client_id=") {
            return self.uri.clone();
        }
        let separator = if self.uri.contains('?') { '&' } else { '?' };
        format!("{}{}client_id={}", self.uri, separator, self.client_id)
    }
}
