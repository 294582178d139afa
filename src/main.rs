mod bridge;
mod command;
mod config;
mod deconz;
mod mqtt;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mqtt2deconz")]
#[command(about = "Forward MQTT light and group commands to the deCONZ REST API")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = config::Config::load(&cli.config);
    init_logging(config.as_ref().map(|c| &c.logging).ok());

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", report(&e));
            std::process::exit(1);
        }
    };

    info!(
        "Starting mqtt2deconz bridge (deconz={}, mqtt={}, prefix={})",
        config.deconz.uri, config.mqtt.client.uri, config.mqtt.topic_prefix,
    );

    if let Err(e) = bridge::run(config, shutdown_signal()).await {
        error!("{}", report(&e));
        error!("Exiting so the service manager can restart the bridge");
        std::process::exit(1);
    }
    info!("mqtt2deconz bridge stopped");
}

async fn shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT, shutting down");
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}

/// `RUST_LOG` wins over the `logging` section of the configuration file.
fn init_logging(levels: Option<&BTreeMap<String, String>>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(levels.map(logging_directives).unwrap_or_else(|| "info".into()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Turn `logging.<target>: <level>` entries into an `EnvFilter` directive
/// string. `root` sets the default level.
fn logging_directives(levels: &BTreeMap<String, String>) -> String {
    let mut root = "info".to_string();
    let mut directives = Vec::new();
    for (target, level) in levels {
        let level = normalize_level(level);
        if target == "root" {
            root = level;
        } else {
            directives.push(format!("{target}={level}"));
        }
    }
    std::iter::once(root)
        .chain(directives)
        .collect::<Vec<_>>()
        .join(",")
}

/// Accept the level names older configuration files use.
fn normalize_level(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        other => other.to_string(),
    }
}

/// Error message followed by its source chain.
fn report(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn should_default_to_info() {
        assert_eq!(logging_directives(&BTreeMap::new()), "info");
    }

    #[test]
    fn should_build_directives_from_logging_section() {
        let levels = BTreeMap::from([
            ("root".to_string(), "WARNING".to_string()),
            ("mqtt_to_deconz::mqtt".to_string(), "DEBUG".to_string()),
            ("rumqttc".to_string(), "CRITICAL".to_string()),
        ]);
        assert_eq!(
            logging_directives(&levels),
            "warn,mqtt_to_deconz::mqtt=debug,rumqttc=error"
        );
        assert!(EnvFilter::try_new(logging_directives(&levels)).is_ok());
    }

    #[test]
    fn should_report_error_chain() {
        let err = ConfigError::Read {
            path: "/etc/mqtt2deconz.yaml".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            report(&err),
            "failed to read /etc/mqtt2deconz.yaml: no such file"
        );
    }

    #[test]
    fn should_require_config_flag() {
        assert!(Cli::try_parse_from(["mqtt2deconz"]).is_err());
        let cli = Cli::try_parse_from(["mqtt2deconz", "--config", "bridge.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("bridge.yaml"));
    }
}
