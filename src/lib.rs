pub mod driver;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod session;
pub mod spatial_index;
pub mod state_machine;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub use driver::DriverId;
pub use error::ServerError;
pub use server::ProximityServer;
pub use server::config::ServerConfig;
pub use spatial_index::{DEFAULT_SEARCH_RADIUS_M, DriverPosition, SpatialIndex};

/// A client-side WebSocket connection to the proximity server.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default address the demo clients connect to.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Connect to the proximity server at `server_url`, a `ws://` URL.
pub async fn connect_client(server_url: &str) -> Result<ClientStream> {
    let url = server_url.parse::<Url>()?;
    if url.scheme() != "ws" {
        anyhow::bail!("unsupported scheme {:?}, expected ws", url.scheme());
    }

    let (stream, _response) = connect_async(url.as_str()).await?;
    Ok(stream)
}
