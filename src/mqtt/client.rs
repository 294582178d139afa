use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS, SubscribeFilter};
use tracing::{debug, info};

use super::{Bus, BusError, BusEvent, InboundMessage};
use crate::config::MqttClientConfig;

/// Capacity of the request channel between [`AsyncClient`] and [`EventLoop`].
const REQUEST_CAPACITY: usize = 100;

/// [`Bus`] backed by `rumqttc`.
///
/// `rumqttc` only moves requests to the socket while the event loop is
/// polled, so every request is sent while polling it. Publishes that arrive
/// in the meantime are buffered and handed out by the next
/// [`Bus::next_event`] call, which keeps resubscription from losing
/// messages.
pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    pending: VecDeque<InboundMessage>,
}

impl MqttClient {
    /// Connects and waits for the broker's CONNACK. Any error here is fatal;
    /// the process is expected to be restarted by its supervisor.
    pub async fn connect(config: &MqttClientConfig) -> Result<Self, BusError> {
        let mut mqttopts = MqttOptions::parse_url(config.broker_url()).map_err(BusError::Options)?;
        mqttopts.set_clean_session(config.clean_session);
        mqttopts.set_keep_alive(config.keep_alive);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttopts.set_credentials(user, pass);
        }

        info!("Connecting to MQTT at {}", config.uri);
        let (client, mut eventloop) = AsyncClient::new(mqttopts, REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!("Connected to MQTT broker (session present: {})", ack.session_present);
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(BusError::Connection(e)),
            }
        }

        Ok(Self {
            client,
            eventloop,
            pending: VecDeque::new(),
        })
    }

    async fn next_publish(&mut self) -> Result<InboundMessage, BusError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => return Err(BusError::Closed),
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => return Err(BusError::Connection(e)),
            }
        }
    }
}

/// Polls the event loop until `request` has been queued, buffering any
/// publish received meanwhile.
async fn drive<F>(
    eventloop: &mut EventLoop,
    pending: &mut VecDeque<InboundMessage>,
    request: F,
) -> Result<(), BusError>
where
    F: Future<Output = Result<(), ClientError>>,
{
    tokio::pin!(request);
    loop {
        tokio::select! {
            result = &mut request => return result.map_err(BusError::Client),
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    pending.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(_) => {}
                Err(e) => return Err(BusError::Connection(e)),
            },
        }
    }
}

impl Bus for MqttClient {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        if topics.is_empty() {
            return Ok(());
        }
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce))
            .collect();
        let Self {
            client,
            eventloop,
            pending,
        } = self;
        drive(eventloop, pending, client.subscribe_many(filters)).await
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        let Self {
            client,
            eventloop,
            pending,
        } = self;
        for topic in topics {
            drive(eventloop, pending, client.unsubscribe(topic.clone())).await?;
        }
        Ok(())
    }

    async fn next_event(&mut self, idle_timeout: Duration) -> BusEvent {
        if let Some(message) = self.pending.pop_front() {
            return BusEvent::Delivered(message);
        }
        match tokio::time::timeout(idle_timeout, self.next_publish()).await {
            Ok(Ok(message)) => BusEvent::Delivered(message),
            Ok(Err(e)) => BusEvent::Fatal(e),
            Err(_) => BusEvent::Idle,
        }
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let Self {
            client,
            eventloop,
            pending,
        } = self;
        drive(eventloop, pending, client.disconnect()).await?;
        // Flush the DISCONNECT packet; the event loop reports the closed
        // connection as an error afterwards, which is expected here.
        let _ = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await;
        Ok(())
    }
}
