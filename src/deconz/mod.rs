pub mod actuator;
pub mod directory;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::config::DeconzConfig;

/// The two REST resources a command can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    Light,
    Group,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Light, DeviceType::Group];

    /// Path segment used both in REST URLs and in bus topics.
    pub fn path_segment(self) -> &'static str {
        match self {
            DeviceType::Light => "lights",
            DeviceType::Group => "groups",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lights" => Ok(DeviceType::Light),
            "groups" => Ok(DeviceType::Group),
            other => Err(format!("unknown device type {other:?}")),
        }
    }
}

/// Identifier assigned by the gateway. Kept as the exact string the gateway
/// reported so leading zeros and formatting survive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL builder for the gateway REST API. The API key is part of the path.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(config: &DeconzConfig) -> Self {
        Self {
            base: format!("{}/api/{}", config.uri.trim_end_matches('/'), config.apikey),
        }
    }

    /// `GET {uri}/api/{apikey}/{lights|groups}`
    pub fn inventory(&self, device_type: DeviceType) -> String {
        format!("{}/{}", self.base, device_type.path_segment())
    }

    /// `GET {uri}/api/{apikey}/lights/{id}`
    pub fn light(&self, id: &DeviceId) -> String {
        format!("{}/lights/{}", self.base, id)
    }

    /// `PUT {uri}/api/{apikey}/lights/{id}/state` or
    /// `PUT {uri}/api/{apikey}/groups/{id}/action`
    pub fn state_change(&self, device_type: DeviceType, id: &DeviceId) -> String {
        match device_type {
            DeviceType::Light => format!("{}/lights/{}/state", self.base, id),
            DeviceType::Group => format!("{}/groups/{}/action", self.base, id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to build HTTP client")]
    Build(#[source] reqwest::Error),
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("response from {url} is not valid JSON")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

/// The HTTP side of the bridge: JSON reads and JSON writes.
pub trait HttpClient: Send + Sync {
    /// Fetch `url` and parse the body as JSON. A non-2xx status or an empty
    /// body is reported as an error; a JSON `null` is returned as
    /// [`Value::Null`].
    fn get_json(&self, url: &str) -> impl Future<Output = Result<Value, HttpError>> + Send;

    /// Send `body` to `url` with `Content-Type: application/json` and return
    /// the response status code.
    fn put_json(
        &self,
        url: &str,
        body: &Value,
    ) -> impl Future<Output = Result<u16, HttpError>> + Send;
}

impl<T: HttpClient> HttpClient for Arc<T> {
    fn get_json(&self, url: &str) -> impl Future<Output = Result<Value, HttpError>> + Send {
        (**self).get_json(url)
    }

    fn put_json(
        &self,
        url: &str,
        body: &Value,
    ) -> impl Future<Output = Result<u16, HttpError>> + Send {
        (**self).put_json(url, body)
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpError::Build)?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    async fn get_json(&self, url: &str) -> Result<Value, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| HttpError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.json::<Value>().await.map_err(|source| HttpError::Body {
            url: url.to_string(),
            source,
        })
    }

    async fn put_json(&self, url: &str, body: &Value) -> Result<u16, HttpError> {
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|source| HttpError::Request {
                url: url.to_string(),
                source,
            })?;
        Ok(response.status().as_u16())
    }
}
