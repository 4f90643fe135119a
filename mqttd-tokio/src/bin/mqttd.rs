use mqttd_tokio::{BrokerConfig, MqttServer, MqttServerConfig};
use std::error::Error;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Reads `name` from the environment, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| format!("invalid {}={:?}: {}", name, value, e).into()),
        Err(_) => Ok(default),
    }
}

fn config_from_env() -> Result<MqttServerConfig, Box<dyn Error>> {
    let defaults = MqttServerConfig::default();
    let broker = BrokerConfig::default();
    Ok(MqttServerConfig {
        bind_addr: env_or("MQTTD_BIND", defaults.bind_addr)?,
        broker: BrokerConfig {
            max_connections: env_or("MQTTD_MAX_CONNECTIONS", broker.max_connections)?,
            max_connections_per_ip: env_or("MQTTD_MAX_CONNECTIONS_PER_IP", broker.max_connections_per_ip)?,
            max_messages_per_second: env_or("MQTTD_MAX_MESSAGES_PER_SECOND", broker.max_messages_per_second)?,
            max_subscriptions_per_minute: env_or(
                "MQTTD_MAX_SUBSCRIPTIONS_PER_MINUTE",
                broker.max_subscriptions_per_minute,
            )?,
            max_keep_alive: env_or("MQTTD_MAX_KEEP_ALIVE", broker.max_keep_alive)?,
            max_packet_size: env_or("MQTTD_MAX_PACKET_SIZE", broker.max_packet_size)?,
            retained_enabled: env_or("MQTTD_RETAIN", broker.retained_enabled)?,
            ..broker
        },
        shutdown_timeout: Duration::from_secs(env_or(
            "MQTTD_SHUTDOWN_TIMEOUT_SECS",
            defaults.shutdown_timeout.as_secs(),
        )?),
        ..defaults
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env()?;
    log::info!("Starting mqttd on {}", config.bind_addr);
    log::info!(
        "Configuration: {} max connections ({} per address), {} msgs/s, {} subs/min",
        config.broker.max_connections,
        config.broker.max_connections_per_ip,
        config.broker.max_messages_per_second,
        config.broker.max_subscriptions_per_minute
    );

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = Arc::new(MqttServer::with_config(config));
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    serving.await??;

    let metrics = server.metrics();
    for (name, value) in metrics.entries() {
        log::info!("{}: {}", name, value);
    }
    Ok(())
}
