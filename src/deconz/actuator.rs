use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{DeviceId, DeviceType, Endpoints, HttpClient, HttpError};
use crate::command::{CommandReceiver, CommandRecord};

#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("gateway request failed")]
    Http(#[from] HttpError),
    /// The light read-back had no boolean `state.on`, so there is nothing to
    /// invert. The toggle is dropped rather than treated as "off", which
    /// would switch the light on.
    #[error("light {0} did not report a boolean state.on")]
    MissingState(DeviceId),
}

/// Turns queued commands into gateway state changes.
pub struct ActuatorController<H> {
    http: H,
    endpoints: Endpoints,
}

impl<H: HttpClient> ActuatorController<H> {
    pub fn new(http: H, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Drains the queue until every sender is gone. A failed command is
    /// logged and dropped; it never stops the loop.
    pub async fn run(self, mut commands: CommandReceiver) {
        while let Some(record) = commands.pop().await {
            debug!("Actuating {:?} ({} still queued)", record, commands.len());
            if let Err(e) = self.apply(&record).await {
                warn!(
                    "Dropping command for {} {}: {}",
                    record.device_type, record.device_id, e
                );
            }
        }
        info!("Command queue closed, actuator stopping");
    }

    pub async fn apply(&self, record: &CommandRecord) -> Result<(), ActuationError> {
        let body = self.request_body(record).await?;
        let url = self
            .endpoints
            .state_change(record.device_type, &record.device_id);
        let status = self.http.put_json(&url, &body).await?;
        if (200..300).contains(&status) {
            info!("PUT {} {} -> {}", url, body, status);
        } else {
            warn!("PUT {} {} rejected with status {}", url, body, status);
        }
        Ok(())
    }

    async fn request_body(&self, record: &CommandRecord) -> Result<Value, ActuationError> {
        match (record.device_type, record.toggle) {
            // Groups toggle natively.
            (DeviceType::Group, true) => Ok(json!({"toggle": true})),
            (DeviceType::Group, false) | (DeviceType::Light, false) => {
                Ok(record.fields.to_json())
            }
            (DeviceType::Light, true) => {
                // Not atomic: another writer may change the light between
                // the read and the write.
                let current = self.light_is_on(&record.device_id).await?;
                let mut fields = record.fields.clone();
                fields.on = Some(!current);
                Ok(fields.to_json())
            }
        }
    }

    async fn light_is_on(&self, id: &DeviceId) -> Result<bool, ActuationError> {
        let light = self.http.get_json(&self.endpoints.light(id)).await?;
        light
            .pointer("/state/on")
            .and_then(Value::as_bool)
            .ok_or_else(|| ActuationError::MissingState(id.clone()))
    }
}
