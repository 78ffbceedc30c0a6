use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use proximity_match::protocol::{LocationUpdate, Outbound};
use proximity_match::{DEFAULT_SERVER_URL, DriverId, connect_client};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest step of the simulated random walk, in degrees (~20 m).
const MAX_STEP_DEG: f64 = 0.0002;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let url = std::env::var("SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let driver_id = std::env::var("DRIVER_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    let mut latitude = env_f64("START_LAT", 8.4840)?;
    let mut longitude = env_f64("START_LON", -13.2299)?;

    info!(driver_id = %driver_id, server = %url, "Driver connecting");

    let stream = connect_client(&url).await?;
    let (mut write, mut read) = stream.split();

    info!(driver_id = %driver_id, "Driver is online");

    let driver_id = DriverId::from(driver_id);
    let mut rng = StdRng::from_os_rng();
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                latitude += rng.random_range(-MAX_STEP_DEG..MAX_STEP_DEG);
                longitude += rng.random_range(-MAX_STEP_DEG..MAX_STEP_DEG);

                let update = LocationUpdate {
                    driver_id: driver_id.clone(),
                    latitude,
                    longitude,
                };
                write.send(Message::text(update.envelope().to_string())).await?;

                debug!(lat = latitude, lon = longitude, "Sent location");
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Outbound>(text.as_str()) {
                        Ok(Outbound::Welcome { message }) => info!(%message, "Server greeted us"),
                        Ok(Outbound::Error { message }) => warn!(%message, "Server rejected a frame"),
                        Ok(other) => debug!(envelope = ?other, "Unexpected envelope"),
                        Err(e) => warn!(error = %e, "Undecodable envelope"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Connection error");
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Going offline");
                write.send(Message::Close(None)).await?;
                break;
            }
        }
    }

    Ok(())
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        Err(_) => Ok(default),
    }
}
