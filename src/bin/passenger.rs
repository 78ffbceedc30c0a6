use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use proximity_match::protocol::{Outbound, RideRequest};
use proximity_match::{ClientStream, DEFAULT_SERVER_URL, DriverPosition, connect_client};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let url = std::env::var("SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());

    let request = RideRequest {
        passenger_id: std::env::var("PASSENGER_ID").ok(),
        latitude: env_f64("PASSENGER_LAT")?.unwrap_or(8.4850),
        longitude: env_f64("PASSENGER_LON")?.unwrap_or(-13.2300),
        radius_m: env_f64("SEARCH_RADIUS_M")?,
    };

    info!(
        server = %url,
        lat = request.latitude,
        lon = request.longitude,
        radius_m = ?request.radius_m,
        "Requesting a ride"
    );

    let mut stream = connect_client(&url).await?;
    stream
        .send(Message::text(request.envelope().to_string()))
        .await?;

    let drivers = timeout(REPLY_TIMEOUT, nearby_drivers(&mut stream))
        .await
        .context("no answer from the server")??;

    if drivers.is_empty() {
        warn!("No drivers nearby");
    }
    for driver in &drivers {
        info!(
            driver_id = %driver.driver_id,
            lat = driver.latitude,
            lon = driver.longitude,
            "Driver nearby"
        );
    }

    stream.close(None).await?;
    Ok(())
}

async fn nearby_drivers(stream: &mut ClientStream) -> Result<Vec<DriverPosition>> {
    while let Some(frame) = stream.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match serde_json::from_str::<Outbound>(text.as_str())? {
            Outbound::NearbyDrivers { drivers } => return Ok(drivers),
            Outbound::Welcome { message } => debug!(%message, "Connected"),
            Outbound::Error { message } => bail!("server rejected request: {message}"),
        }
    }
    bail!("server closed the connection before answering")
}

fn env_f64(name: &str) -> Result<Option<f64>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        Err(_) => Ok(None),
    }
}
