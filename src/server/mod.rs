pub mod config;
mod connection;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use self::config::ServerConfig;
use self::connection::{ConnectionContext, serve_connection};
use crate::error::ServerError;
use crate::handler::ProtocolHandler;
use crate::session::ConnectionRegistry;
use crate::spatial_index::SpatialIndex;

/// Pause after a failed `accept` so a persistent failure (e.g. file descriptor exhaustion) does
/// not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The WebSocket front of the service: accepts connections and runs one task per connection
/// against the shared [`SpatialIndex`] and [`ConnectionRegistry`].
pub struct ProximityServer {
    listener: TcpListener,
    config: ServerConfig,
    index: Arc<SpatialIndex>,
    registry: Arc<ConnectionRegistry>,
}

impl ProximityServer {
    /// Bind the listener described by `config`.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self {
            listener,
            config,
            index: Arc::new(SpatialIndex::new()),
            registry: Arc::new(ConnectionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    pub fn index(&self) -> Arc<SpatialIndex> {
        Arc::clone(&self.index)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// Once `shutdown` resolves no new connections are accepted. Connections already open keep
    /// their own tasks and end when their peers leave.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let addr = self.local_addr()?;

        let sweeper = self.config.staleness().map(|stale_after| {
            spawn_sweeper(
                Arc::clone(&self.index),
                stale_after,
                self.config.sweep_interval,
            )
        });

        let context = ConnectionContext {
            handler: ProtocolHandler::new(
                Arc::clone(&self.index),
                Arc::clone(&self.registry),
                self.config.default_radius_m,
            ),
            registry: Arc::clone(&self.registry),
            index: Arc::clone(&self.index),
            retention: self.config.retention,
            service_name: Arc::from(self.config.service_name.as_str()),
            outbound_capacity: self.config.outbound_capacity.max(1),
        };

        info!(
            address = %addr,
            radius_m = self.config.default_radius_m,
            retention = ?self.config.retention,
            stale_after = ?self.config.staleness(),
            "Proximity server listening"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted TCP connection");
                        tokio::spawn(serve_connection(stream, peer, context.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        Ok(())
    }
}

/// Periodically evict positions that have not been refreshed for `stale_after`.
pub fn spawn_sweeper(
    index: Arc<SpatialIndex>,
    stale_after: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(cutoff) = Instant::now().checked_sub(stale_after) else {
                continue;
            };
            let evicted = index.evict_stale(cutoff);
            if !evicted.is_empty() {
                info!(count = evicted.len(), drivers = ?evicted, "Evicted stale driver positions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use super::*;
    use crate::driver::DriverId;
    use crate::protocol::{LocationUpdate, Outbound, RideRequest};
    use crate::session::PositionRetention;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Running {
        addr: SocketAddr,
        index: Arc<SpatialIndex>,
        registry: Arc<ConnectionRegistry>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ServerError>>,
    }

    fn local_config() -> ServerConfig {
        ServerConfig::builder()
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build()
    }

    async fn start(config: ServerConfig) -> Running {
        let server = ProximityServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let index = server.index();
        let registry = server.registry();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = signal.await;
        }));
        Running {
            addr,
            index,
            registry,
            shutdown,
            task,
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws
    }

    /// Connect and consume the welcome envelope.
    async fn join(addr: SocketAddr) -> Client {
        let mut ws = connect(addr).await;
        assert!(matches!(next_envelope(&mut ws).await, Outbound::Welcome { .. }));
        ws
    }

    async fn next_envelope(ws: &mut Client) -> Outbound {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for an envelope")
                .expect("connection ended")
                .expect("transport error");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn assert_silent(ws: &mut Client) {
        let next = timeout(Duration::from_millis(200), ws.next()).await;
        assert!(next.is_err(), "expected no traffic, got {next:?}");
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn send_json(ws: &mut Client, value: serde_json::Value) {
        ws.send(Message::text(value.to_string())).await.unwrap();
    }

    fn update(driver: &str, latitude: f64, longitude: f64) -> serde_json::Value {
        LocationUpdate {
            driver_id: driver.into(),
            latitude,
            longitude,
        }
        .envelope()
    }

    fn request(latitude: f64, longitude: f64) -> serde_json::Value {
        RideRequest {
            passenger_id: None,
            latitude,
            longitude,
            radius_m: None,
        }
        .envelope()
    }

    fn driver_ids(envelope: Outbound) -> Vec<String> {
        let Outbound::NearbyDrivers { drivers } = envelope else {
            panic!("expected nearbyDrivers, got {envelope:?}");
        };
        let mut ids: Vec<String> = drivers
            .into_iter()
            .map(|d| d.driver_id.as_str().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_welcome_is_sent_first() {
        let server = start(local_config()).await;
        let mut ws = connect(server.addr).await;

        assert_eq!(
            next_envelope(&mut ws).await,
            Outbound::Welcome {
                message: "Connected to WebSocket server".to_string(),
            }
        );
        wait_until(|| server.registry.active_session_count() == 1).await;
    }

    #[tokio::test]
    async fn test_passenger_finds_nearby_driver() {
        let server = start(local_config()).await;
        let mut driver = join(server.addr).await;
        let mut passenger = join(server.addr).await;

        send_json(&mut driver, update("D", 8.4840, -13.2299)).await;
        let index = Arc::clone(&server.index);
        wait_until(move || index.position(&DriverId::from("D")).is_some()).await;

        send_json(&mut passenger, request(8.4850, -13.2300)).await;
        assert_eq!(driver_ids(next_envelope(&mut passenger).await), vec!["D"]);
        assert_silent(&mut driver).await;
    }

    #[tokio::test]
    async fn test_only_drivers_within_radius_are_returned() {
        let server = start(local_config()).await;
        let mut driver = join(server.addr).await;
        let mut passenger = join(server.addr).await;

        send_json(&mut driver, update("A", 8.4840, -13.2299)).await;
        send_json(&mut driver, update("B", 8.5739, -13.2299)).await;
        let index = Arc::clone(&server.index);
        wait_until(move || index.len() == 2).await;

        send_json(&mut passenger, request(8.4840, -13.2299)).await;
        assert_eq!(driver_ids(next_envelope(&mut passenger).await), vec!["A"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_isolated() {
        let server = start(local_config()).await;
        let mut a = join(server.addr).await;
        let mut b = join(server.addr).await;

        a.send(Message::text("{definitely not json".to_string())).await.unwrap();

        assert!(matches!(next_envelope(&mut a).await, Outbound::Error { .. }));
        assert_silent(&mut a).await;
        assert_silent(&mut b).await;

        // The offending connection stays usable
        send_json(&mut a, request(0.0, 0.0)).await;
        assert!(matches!(
            next_envelope(&mut a).await,
            Outbound::NearbyDrivers { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_envelopes_get_no_reply() {
        let server = start(local_config()).await;
        let mut ws = join(server.addr).await;

        send_json(
            &mut ws,
            serde_json::json!({"type": "locationUpdate", "role": "user", "driver": "D",
                "data": {"latitude": 1.0, "longitude": 2.0}}),
        )
        .await;
        send_json(&mut ws, serde_json::json!({"type": "cancelRide"})).await;

        assert_silent(&mut ws).await;
        assert!(server.index.is_empty());
    }

    #[tokio::test]
    async fn test_driver_disconnect_clears_position() {
        let server = start(local_config()).await;
        let mut driver = join(server.addr).await;

        send_json(&mut driver, update("D", 1.0, 1.0)).await;
        let index = Arc::clone(&server.index);
        wait_until(move || index.len() == 1).await;

        driver.close(None).await.unwrap();
        drop(driver);

        let index = Arc::clone(&server.index);
        let registry = Arc::clone(&server.registry);
        wait_until(move || index.is_empty() && registry.active_session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_keep_retention_survives_disconnect() {
        let config = ServerConfig::builder()
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .retention(PositionRetention::Keep)
            .build();
        let server = start(config).await;
        let mut driver = join(server.addr).await;

        send_json(&mut driver, update("D", 1.0, 1.0)).await;
        let index = Arc::clone(&server.index);
        wait_until(move || index.len() == 1).await;

        drop(driver);
        let registry = Arc::clone(&server.registry);
        wait_until(move || registry.active_session_count() == 0).await;
        assert_eq!(server.index.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_silent_drivers() {
        let config = ServerConfig::builder()
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .stale_after(Duration::from_millis(100))
            .sweep_interval(Duration::from_millis(20))
            .build();
        let server = start(config).await;
        let mut driver = join(server.addr).await;

        send_json(&mut driver, update("D", 1.0, 1.0)).await;
        let index = Arc::clone(&server.index);
        wait_until(move || index.len() == 1).await;

        // Still connected, but no longer reporting
        let index = Arc::clone(&server.index);
        wait_until(move || index.is_empty()).await;
        assert_eq!(server.registry.active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = start(local_config()).await;
        let addr = server.addr;

        server.shutdown.send(()).unwrap();
        server.task.await.unwrap().unwrap();

        assert!(connect_async(format!("ws://{addr}")).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = ProximityServer::bind(local_config()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let config = ServerConfig::builder().bind_addr(taken).build();
        let result = ProximityServer::bind(config).await;
        assert!(matches!(result, Err(ServerError::Bind { addr, .. }) if addr == taken));
    }
}
