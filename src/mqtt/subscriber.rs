use std::convert::Infallible;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{Bus, BusError, BusEvent, InboundMessage};
use crate::command::{CommandRecord, CommandSender, QueueClosed, StateFields};
use crate::deconz::directory::{DeviceDirectory, Inventory};
use crate::deconz::{DeviceId, DeviceType, HttpClient};

const COMMAND_SUFFIX: &str = "cmnd";

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("failed to connect to MQTT")]
    Connect(#[source] BusError),
    #[error("MQTT subscription failed")]
    Bus(#[source] BusError),
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("topic {0} is not a device command topic")]
    Topic(String),
    #[error("payload is not valid JSON")]
    Payload(#[source] serde_json::Error),
    #[error("payload is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("payload has invalid on/bri values")]
    Fields(#[source] serde_json::Error),
}

/// `{prefix}/{lights|groups}/{id}/cmnd`
pub fn command_topic(prefix: &str, device_type: DeviceType, id: &DeviceId) -> String {
    format!("{prefix}/{device_type}/{id}/{COMMAND_SUFFIX}")
}

/// Command topics for every device in `inventory`, lights first.
pub fn command_topics(prefix: &str, inventory: &Inventory) -> Vec<String> {
    DeviceType::ALL
        .into_iter()
        .flat_map(|device_type| {
            inventory
                .devices(device_type)
                .map(move |id| command_topic(prefix, device_type, id))
        })
        .collect()
}

/// Parse a command topic into (device type, device id).
/// Expected format: {prefix}/{lights|groups}/{digits}/cmnd
fn parse_command_topic(topic: &str, prefix: &str) -> Option<(DeviceType, DeviceId)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (segment, rest) = rest.split_once('/')?;
    let (id, suffix) = rest.split_once('/')?;
    if suffix != COMMAND_SUFFIX || id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((segment.parse().ok()?, DeviceId::from(id)))
}

/// Decode an inbound publish into a [`CommandRecord`]. The presence of a
/// `toggle` key sets `toggle`, only `on` and `bri` are kept as fields.
pub fn decode(prefix: &str, message: &InboundMessage) -> Result<CommandRecord, DecodeError> {
    let (device_type, device_id) = parse_command_topic(&message.topic, prefix)
        .ok_or_else(|| DecodeError::Topic(message.topic.clone()))?;

    let payload = match serde_json::from_slice(&message.payload).map_err(DecodeError::Payload)? {
        Value::Object(map) => map,
        other => return Err(DecodeError::NotAnObject(other.to_string())),
    };
    let toggle = payload.contains_key("toggle");
    let fields: StateFields =
        serde_json::from_value(Value::Object(payload)).map_err(DecodeError::Fields)?;

    Ok(CommandRecord {
        device_type,
        device_id,
        toggle,
        fields,
    })
}

/// Subscribes to the command topic of every discovered device and feeds
/// decoded commands into the queue.
///
/// When no message arrives within `idle_timeout` the subscription is
/// rebuilt from a fresh directory snapshot, which is how devices added to
/// the gateway become reachable without a restart. Any other bus failure
/// ends the loop.
pub struct TopicSubscriber<B, H> {
    bus: B,
    directory: DeviceDirectory<H>,
    commands: CommandSender,
    prefix: String,
    idle_timeout: Duration,
}

impl<B: Bus, H: HttpClient> TopicSubscriber<B, H> {
    pub fn new(
        bus: B,
        directory: DeviceDirectory<H>,
        commands: CommandSender,
        prefix: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            directory,
            commands,
            prefix: prefix.into(),
            idle_timeout,
        }
    }

    /// Runs until the bus fails or the actuator goes away.
    pub async fn run(mut self) -> Result<Infallible, SubscriberError> {
        let mut topics = self.current_topics().await;
        if let Err(e) = self.subscribe(&topics).await {
            return Err(self.fail(&topics, e).await);
        }

        loop {
            match self.bus.next_event(self.idle_timeout).await {
                BusEvent::Delivered(message) => {
                    if let Err(e) = self.dispatch(&message) {
                        error!("Actuator is gone, stopping subscriber");
                        self.shutdown(&topics).await;
                        return Err(e.into());
                    }
                }
                BusEvent::Idle => {
                    debug!("Timeout. Refreshing subscription");
                    match self.resubscribe(&topics).await {
                        Ok(refreshed) => topics = refreshed,
                        Err(e) => return Err(self.fail(&topics, e).await),
                    }
                }
                BusEvent::Fatal(e) => return Err(self.fail(&topics, e).await),
            }
        }
    }

    fn dispatch(&self, message: &InboundMessage) -> Result<(), QueueClosed> {
        info!(
            "Got message on {}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
        match decode(&self.prefix, message) {
            Ok(record) => {
                info!(
                    "Got command for {} {} (toggle: {})",
                    record.device_type, record.device_id, record.toggle
                );
                self.commands.push(record)?;
            }
            Err(e) => warn!("Dropping message on {}: {}", message.topic, e),
        }
        Ok(())
    }

    async fn current_topics(&mut self) -> Vec<String> {
        let inventory = self.directory.snapshot().await;
        for device_type in DeviceType::ALL {
            if !inventory.contains_type(device_type) {
                warn!("No {} known from deCONZ, their commands are not subscribed", device_type);
            }
        }
        let topics = command_topics(&self.prefix, &inventory);
        debug!("Retrieved device topics: {:?}", topics);
        topics
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        if topics.is_empty() {
            warn!("No device topics to subscribe to, retrying after idle timeout");
            return Ok(());
        }
        self.bus.subscribe(topics).await?;
        info!("Subscribed to {} topics", topics.len());
        Ok(())
    }

    async fn resubscribe(&mut self, current: &[String]) -> Result<Vec<String>, BusError> {
        if !current.is_empty() {
            self.bus.unsubscribe(current).await?;
        }
        let topics = self.current_topics().await;
        self.subscribe(&topics).await?;
        Ok(topics)
    }

    async fn fail(&mut self, topics: &[String], e: BusError) -> SubscriberError {
        error!("MQTT client error: {}", e);
        self.shutdown(topics).await;
        SubscriberError::Bus(e)
    }

    /// Best effort: the connection may already be gone.
    async fn shutdown(&mut self, topics: &[String]) {
        if !topics.is_empty() {
            if let Err(e) = self.bus.unsubscribe(topics).await {
                debug!("Unsubscribe during shutdown failed: {}", e);
            }
        }
        if let Err(e) = self.bus.disconnect().await {
            debug!("Disconnect during shutdown failed: {}", e);
        }
    }
}
