use std::convert::Infallible;
use std::future::Future;

use tokio::task::{JoinError, JoinHandle};
use tracing::info;

use crate::command;
use crate::config::Config;
use crate::deconz::actuator::ActuatorController;
use crate::deconz::directory::DeviceDirectory;
use crate::deconz::{Endpoints, HttpError, ReqwestClient};
use crate::mqtt::client::MqttClient;
use crate::mqtt::subscriber::{SubscriberError, TopicSubscriber};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
    #[error("actuator stopped")]
    ActuatorStopped,
    #[error("{0} task panicked")]
    Panicked(&'static str, #[source] JoinError),
}

/// Wires the subscriber and the actuator together and runs them until one of
/// them stops or `shutdown` resolves. There is no in-process retry: on error
/// the caller is expected to exit and let the service manager restart the
/// bridge.
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), BridgeError>
where
    F: Future<Output = ()>,
{
    let http = ReqwestClient::new(config.deconz.request_timeout)?;
    let endpoints = Endpoints::new(&config.deconz);
    let directory = DeviceDirectory::new(
        http.clone(),
        endpoints.clone(),
        config.deconz.discovery_ttl,
    );
    let actuator = ActuatorController::new(http, endpoints);
    let (commands, queue) = command::queue(config.mqtt.queue_capacity);

    let mqtt = config.mqtt;
    let subscriber = async move {
        let bus = MqttClient::connect(&mqtt.client)
            .await
            .map_err(SubscriberError::Connect)?;
        TopicSubscriber::new(
            bus,
            directory,
            commands,
            mqtt.topic_prefix,
            mqtt.idle_timeout,
        )
        .run()
        .await
    };

    supervise(subscriber, actuator.run(queue), shutdown).await
}

/// Spawns both halves and waits for the first one to finish or for
/// `shutdown`, then aborts both. The halves are meant to run forever, so
/// any completion is an error.
pub async fn supervise<S, A, F>(
    subscriber: S,
    actuator: A,
    shutdown: F,
) -> Result<(), BridgeError>
where
    S: Future<Output = Result<Infallible, SubscriberError>> + Send + 'static,
    A: Future<Output = ()> + Send + 'static,
    F: Future<Output = ()>,
{
    let mut subscriber = tokio::spawn(subscriber);
    let mut actuator = tokio::spawn(actuator);

    let result = tokio::select! {
        result = &mut subscriber => {
            stop(&mut actuator).await;
            match result {
                Ok(Err(e)) => Err(BridgeError::Subscriber(e)),
                Err(e) => Err(BridgeError::Panicked("subscriber", e)),
            }
        }
        result = &mut actuator => {
            stop(&mut subscriber).await;
            match result {
                Ok(()) => Err(BridgeError::ActuatorStopped),
                Err(e) => Err(BridgeError::Panicked("actuator", e)),
            }
        }
        () = shutdown => {
            stop(&mut subscriber).await;
            stop(&mut actuator).await;
            Ok(())
        }
    };

    info!("Bridge tasks stopped");
    result
}

/// Aborts a task that has not finished and waits for the abort to land.
async fn stop<T>(task: &mut JoinHandle<T>) {
    task.abort();
    let _ = task.await;
}
