use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::deconz::{DeviceId, DeviceType};

/// Whitelisted state attributes forwarded to the gateway. Anything else in
/// an inbound payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StateFields {
    #[serde(default)]
    pub on: Option<bool>,
    /// Forwarded as given; the gateway enforces its own range.
    #[serde(default)]
    pub bri: Option<i64>,
}

impl StateFields {
    /// Flat JSON object holding only the attributes that are set.
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(on) = self.on {
            body.insert("on".to_string(), Value::Bool(on));
        }
        if let Some(bri) = self.bri {
            body.insert("bri".to_string(), Value::from(bri));
        }
        Value::Object(body)
    }
}

/// A decoded bus command, consumed exactly once by the actuator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub device_type: DeviceType,
    pub device_id: DeviceId,
    /// Set when the payload carried a `toggle` key, whatever its value.
    pub toggle: bool,
    pub fields: StateFields,
}

/// What happened to a record handed to [`CommandSender::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was at capacity and the incoming record was discarded.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
#[error("command queue closed")]
pub struct QueueClosed;

/// Creates the bounded hand-off between the subscriber and the actuator.
///
/// When the queue is full the incoming record is dropped (drop-newest);
/// records already queued are never displaced, so the actuator always sees
/// the oldest pending commands in bus order.
pub fn queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandSender { tx }, CommandReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<CommandRecord>,
}

impl CommandSender {
    /// Never waits for room in the queue.
    pub fn push(&self, record: CommandRecord) -> Result<PushOutcome, QueueClosed> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(PushOutcome::Queued),
            Err(TrySendError::Full(record)) => {
                warn!(
                    "Command queue full, dropping command for {} {}",
                    record.device_type, record.device_id
                );
                Ok(PushOutcome::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(QueueClosed),
        }
    }
}

#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<CommandRecord>,
}

impl CommandReceiver {
    /// Waits for the next record. `None` once every sender is gone and the
    /// queue is drained.
    pub async fn pop(&mut self) -> Option<CommandRecord> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}
