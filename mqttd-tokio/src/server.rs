use crate::handler::{handle_connection, HandlerConfig};
use crate::io::StreamTransport;
use log::{debug, error, info, trace, warn};
use mqttd_core::{Broker, BrokerConfig, Health, MetricsSnapshot, SessionError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration, Instant};

/// Runtime configuration for the MQTT server
#[derive(Debug, Clone)]
pub struct MqttServerConfig {
    /// Listen address (default: 0.0.0.0:1883)
    pub bind_addr: String,
    pub broker: BrokerConfig,
    /// Initial read buffer per connection in bytes (default: 4096)
    pub read_buffer_capacity: usize,
    /// Time a connection gets to send CONNECT (default: 10s)
    pub connect_timeout: Duration,
    /// Time live sessions get to drain on shutdown before being aborted (default: 5s)
    pub shutdown_timeout: Duration,
    /// Expired retained message sweep interval (default: 60s)
    pub cleanup_interval: Duration,
}

impl Default for MqttServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".to_owned(),
            broker: BrokerConfig::default(),
            read_buffer_capacity: 4096,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// A Tokio-based MQTT broker server
pub struct MqttServer {
    broker: Arc<Broker>,
    config: MqttServerConfig,
    shutdown: watch::Sender<bool>,
}

impl MqttServer {
    /// Create a new server with default configuration
    pub fn new() -> Self {
        Self::with_config(MqttServerConfig::default())
    }

    /// Create a new server with custom configuration
    pub fn with_config(config: MqttServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker: Arc::new(Broker::new(config.broker.clone())),
            config,
            shutdown,
        }
    }

    /// Get a handle to the shared broker for external interaction
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn config(&self) -> &MqttServerConfig {
        &self.config
    }

    /// Get the number of admitted connections
    pub fn connection_count(&self) -> usize {
        self.broker.limits().current_connections()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.broker.metrics()
    }

    pub fn health(&self) -> Health {
        self.broker.health()
    }

    /// Ask a running [`MqttServer::serve`] to stop accepting and drain.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Run the server, binding to the configured address
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until [`MqttServer::shutdown`].
    ///
    /// On shutdown, live sessions get `shutdown_timeout` to finish in-flight
    /// acknowledgements; the rest are aborted.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!("Server listening on {}", local);
        debug!(
            "Server configuration: max_connections={}, max_connections_per_ip={}, max_packet_size={}, shutdown_timeout={:?}",
            self.config.broker.max_connections,
            self.config.broker.max_connections_per_ip,
            self.config.broker.max_packet_size,
            self.config.shutdown_timeout
        );

        let mut stop = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        let cleanup = tokio::spawn(cleanup_task(Arc::clone(&self.broker), self.config.cleanup_interval));
        let handler_config = HandlerConfig {
            read_buffer_capacity: self.config.read_buffer_capacity,
            connect_timeout: self.config.connect_timeout,
        };

        info!("Accepting incoming connections on {}...", local);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => self.admit(socket, addr, &handler_config, &mut tasks),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        // usually descriptor exhaustion; back off instead of spinning
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => log_task_end(finished),
                // drop the watch::Ref inside: its guard is not Send
                _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => break,
            }
        }

        drop(listener);
        cleanup.abort();
        self.drain(&mut tasks).await;
        info!("Server on {} stopped", local);
        Ok(())
    }

    fn admit(
        &self,
        socket: tokio::net::TcpStream,
        addr: SocketAddr,
        config: &HandlerConfig,
        tasks: &mut JoinSet<Result<(), SessionError>>,
    ) {
        // rejected before any byte is read, so no CONNACK can be sent
        let permit = match self.broker.admit(addr.ip()) {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Rejecting connection from {}: {}", addr, e);
                return;
            }
        };
        info!("New connection from {}", addr);

        let broker = Arc::clone(&self.broker);
        let config = config.clone();
        tasks.spawn(async move {
            let result = handle_connection(StreamTransport::tcp(socket), broker, &config).await;
            drop(permit);
            result
        });
    }

    async fn drain(&self, tasks: &mut JoinSet<Result<(), SessionError>>) {
        self.broker.begin_shutdown();
        let live = tasks.len();
        if live == 0 {
            return;
        }
        info!("Waiting up to {:?} for {} sessions to drain", self.config.shutdown_timeout, live);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !tasks.is_empty() {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(finished)) => log_task_end(finished),
                Ok(None) => break,
                Err(_) => {
                    warn!("Shutdown timeout: aborting {} sessions", tasks.len());
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}

impl Default for MqttServer {
    fn default() -> Self {
        Self::new()
    }
}

fn log_task_end(finished: Result<Result<(), SessionError>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => trace!("Connection task finished"),
        Ok(Err(e)) => debug!("Connection ended: {} ({})", e, e.kind()),
        Err(e) if e.is_cancelled() => trace!("Connection task aborted"),
        Err(e) => error!("Connection task failed: {}", e),
    }
}

/// Background cleanup task for expired retained messages
async fn cleanup_task(broker: Arc<Broker>, interval: Duration) {
    info!("Cleanup task started (interval: {:?})", interval);
    loop {
        sleep(interval).await;
        let removed = broker.sweep_expired(Instant::now().into_std());
        if removed > 0 {
            info!("Removed {} expired retained messages", removed);
        } else {
            trace!("Cleanup scan complete: nothing expired");
        }
    }
}
