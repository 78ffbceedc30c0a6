use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An opaque identifier for a driver as issued by the identity service.
///
/// The service never validates it against any source of truth. Clients send it either as a JSON
/// string or as a JSON number; numbers are kept in their decimal text form so `7` and `"7"` name
/// the same driver.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DriverId(Arc<str>);

impl DriverId {
    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DriverId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for DriverId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl Serialize for DriverId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl<'de> Deserialize<'de> for DriverId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match WireId::deserialize(deserializer)? {
            WireId::Text(text) => Ok(Self::from(text)),
            WireId::Number(number) => Ok(Self::from(number.to_string())),
        }
    }
}
