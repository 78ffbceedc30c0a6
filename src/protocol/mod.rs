//! JSON envelopes exchanged with driver and passenger clients.
//!
//! Inbound frames are decoded into the closed [`Inbound`] set at the boundary. Every envelope is
//! keyed by its `type` and the `role` the peer declares:
//!
//! | type             | role                  | payload                                           |
//! |------------------|-----------------------|---------------------------------------------------|
//! | `locationUpdate` | `driver`              | `driver`, `data.latitude`, `data.longitude`       |
//! | `requestRide`    | `passenger` or `user` | `latitude`, `longitude`, optional `radius`, `user` |
//!
//! Anything else decodes to [`Inbound::Ignored`].

pub mod error;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use self::error::DecodeError;
use crate::driver::DriverId;
use crate::spatial_index::DriverPosition;

pub const LOCATION_UPDATE: &str = "locationUpdate";
pub const REQUEST_RIDE: &str = "requestRide";

pub const DRIVER_ROLE: &str = "driver";
pub const PASSENGER_ROLE: &str = "passenger";
/// Role name the passenger app historically sends.
pub const USER_ROLE: &str = "user";

#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationUpdate {
    /// The wire form a driver client sends.
    pub fn envelope(&self) -> Value {
        json!({
            "type": LOCATION_UPDATE,
            "role": DRIVER_ROLE,
            "driver": self.driver_id,
            "data": {
                "latitude": self.latitude,
                "longitude": self.longitude,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RideRequest {
    pub passenger_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Search radius in meters; the server default applies when absent.
    pub radius_m: Option<f64>,
}

impl RideRequest {
    /// The wire form a passenger client sends.
    pub fn envelope(&self) -> Value {
        let mut envelope = json!({
            "type": REQUEST_RIDE,
            "role": PASSENGER_ROLE,
            "latitude": self.latitude,
            "longitude": self.longitude,
        });
        if let Some(user) = &self.passenger_id {
            envelope["user"] = json!(user);
        }
        if let Some(radius) = self.radius_m {
            envelope["radius"] = json!(radius);
        }
        envelope
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    LocationUpdate(LocationUpdate),
    RequestRide(RideRequest),
    /// Well-formed JSON whose `type`/`role` combination the service does not handle.
    Ignored {
        kind: Option<String>,
        role: Option<String>,
    },
}

#[derive(Deserialize)]
struct LocationUpdateWire {
    driver: DriverId,
    data: CoordinatesWire,
}

#[derive(Deserialize)]
struct CoordinatesWire {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RideRequestWire {
    latitude: f64,
    longitude: f64,
    #[serde(default, alias = "radiusMeters")]
    radius: Option<f64>,
    #[serde(default)]
    user: Option<Value>,
}

enum Route {
    LocationUpdate,
    RequestRide,
    Ignored {
        kind: Option<String>,
        role: Option<String>,
    },
}

/// Decode a text frame into an [`Inbound`] envelope.
pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_str(text)?;

    let kind = value.get("type").and_then(Value::as_str);
    let role = value.get("role").and_then(Value::as_str);
    let route = match (kind, role) {
        (Some(LOCATION_UPDATE), Some(DRIVER_ROLE)) => Route::LocationUpdate,
        (Some(REQUEST_RIDE), Some(PASSENGER_ROLE | USER_ROLE)) => Route::RequestRide,
        _ => Route::Ignored {
            kind: kind.map(str::to_string),
            role: role.map(str::to_string),
        },
    };

    match route {
        Route::LocationUpdate => {
            let wire: LocationUpdateWire = serde_json::from_value(value)?;
            let (latitude, longitude) = finite_pair(wire.data.latitude, wire.data.longitude)?;
            Ok(Inbound::LocationUpdate(LocationUpdate {
                driver_id: wire.driver,
                latitude,
                longitude,
            }))
        }
        Route::RequestRide => {
            let wire: RideRequestWire = serde_json::from_value(value)?;
            let (latitude, longitude) = finite_pair(wire.latitude, wire.longitude)?;
            if let Some(radius) = wire.radius {
                if !radius.is_finite() || radius < 0.0 {
                    return Err(DecodeError::InvalidRadius(radius));
                }
            }
            Ok(Inbound::RequestRide(RideRequest {
                passenger_id: wire.user.and_then(opaque_id),
                latitude,
                longitude,
                radius_m: wire.radius,
            }))
        }
        Route::Ignored { kind, role } => Ok(Inbound::Ignored { kind, role }),
    }
}

/// Decode a binary frame, which clients may use to carry the same JSON text.
pub fn decode_bytes(bytes: &[u8]) -> Result<Inbound, DecodeError> {
    decode(std::str::from_utf8(bytes)?)
}

fn finite_pair(latitude: f64, longitude: f64) -> Result<(f64, f64), DecodeError> {
    if !latitude.is_finite() {
        return Err(DecodeError::NonFiniteCoordinate { field: "latitude" });
    }
    if !longitude.is_finite() {
        return Err(DecodeError::NonFiniteCoordinate { field: "longitude" });
    }
    Ok((latitude, longitude))
}

fn opaque_id(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// An envelope sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    Welcome { message: String },
    NearbyDrivers { drivers: Vec<DriverPosition> },
    Error { message: String },
}

impl Outbound {
    pub fn welcome(service_name: &str) -> Self {
        Self::Welcome {
            message: format!("Connected to {service_name}"),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
