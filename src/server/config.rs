use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use thiserror::Error;

use crate::session::PositionRetention;
use crate::spatial_index::DEFAULT_SEARCH_RADIUS_M;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVICE_NAME: &str = "WebSocket server";
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Raised when an environment variable holds a value the server cannot use.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {name}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

/// Configuration for the proximity server.
#[derive(Debug, Clone, Builder)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    pub bind_addr: SocketAddr,

    /// Name announced in the `welcome` envelope (`Connected to {service_name}`).
    #[builder(default = DEFAULT_SERVICE_NAME.to_string())]
    pub service_name: String,

    /// Radius in meters for ride requests that do not carry one.
    #[builder(default = DEFAULT_SEARCH_RADIUS_M)]
    pub default_radius_m: f64,

    /// Whether a driver's position outlives the session that reported it.
    #[builder(default)]
    pub retention: PositionRetention,

    /// Age after which a position that has not been refreshed is evicted.
    /// [`Duration::ZERO`] disables eviction.
    #[builder(default = Duration::from_secs(120))]
    pub stale_after: Duration,

    /// How often stale positions are looked for.
    #[builder(default = Duration::from_secs(15))]
    pub sweep_interval: Duration,

    /// Envelopes queued per connection before further replies to it are dropped. Clamped to at
    /// least one.
    #[builder(default = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,
}

impl ServerConfig {
    /// Load the configuration from `PROXIMITY_*` environment variables, falling back to the
    /// defaults for any that are unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_radius_m = parse_or(&lookup, "PROXIMITY_RADIUS_M", defaults.default_radius_m)?;
        if !default_radius_m.is_finite() || default_radius_m < 0.0 {
            return Err(ConfigError {
                name: "PROXIMITY_RADIUS_M",
                value: default_radius_m.to_string(),
                reason: "must be a non-negative number of meters".to_string(),
            });
        }

        let sweep_interval_secs = parse_or(
            &lookup,
            "PROXIMITY_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
        )?;
        if sweep_interval_secs == 0 {
            return Err(ConfigError {
                name: "PROXIMITY_SWEEP_INTERVAL_SECS",
                value: sweep_interval_secs.to_string(),
                reason: "must be at least one second".to_string(),
            });
        }

        let keep_positions = parse_or(&lookup, "PROXIMITY_KEEP_POSITIONS", false)?;

        let outbound_capacity = parse_or(
            &lookup,
            "PROXIMITY_OUTBOUND_CAPACITY",
            defaults.outbound_capacity,
        )?;
        if outbound_capacity == 0 {
            return Err(ConfigError {
                name: "PROXIMITY_OUTBOUND_CAPACITY",
                value: outbound_capacity.to_string(),
                reason: "must be at least one envelope".to_string(),
            });
        }

        Ok(Self {
            bind_addr: parse_or(&lookup, "PROXIMITY_BIND_ADDR", defaults.bind_addr)?,
            service_name: lookup("PROXIMITY_SERVICE_NAME").unwrap_or(defaults.service_name),
            default_radius_m,
            retention: if keep_positions {
                PositionRetention::Keep
            } else {
                PositionRetention::ClearOnClose
            },
            stale_after: Duration::from_secs(parse_or(
                &lookup,
                "PROXIMITY_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            outbound_capacity,
        })
    }

    /// The eviction age, or `None` when eviction is disabled.
    pub fn staleness(&self) -> Option<Duration> {
        (!self.stale_after.is_zero()).then_some(self.stale_after)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
