pub mod client;
pub mod subscriber;

use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid MQTT options")]
    Options(#[source] rumqttc::OptionError),
    #[error("MQTT connection error")]
    Connection(#[source] rumqttc::ConnectionError),
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),
    #[error("MQTT connection closed")]
    Closed,
}

/// A publish packet received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Result of waiting for the next inbound publish.
#[derive(Debug)]
pub enum BusEvent {
    Delivered(InboundMessage),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The connection is unusable; the caller must give up.
    Fatal(BusError),
}

/// The broker side of the bridge. All subscriptions use QoS 0.
pub trait Bus: Send {
    fn subscribe(&mut self, topics: &[String])
    -> impl Future<Output = Result<(), BusError>> + Send;

    fn unsubscribe(
        &mut self,
        topics: &[String],
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn next_event(&mut self, idle_timeout: Duration) -> impl Future<Output = BusEvent> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), BusError>> + Send;
}
