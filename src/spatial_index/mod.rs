pub mod distance;

use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use crate::driver::DriverId;

use self::distance::haversine_m;

/// Radius used for proximity queries that do not specify one.
pub const DEFAULT_SEARCH_RADIUS_M: f64 = 5000.0;

/// The latest known position of a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPosition {
    #[serde(rename = "id")]
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
}

/// Indicates that a position update carried a coordinate that is not a finite number.
#[derive(Debug, thiserror::Error)]
#[error("coordinates for driver {driver_id} must be finite numbers (latitude {latitude}, longitude {longitude})")]
pub struct InvalidCoordinate {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    latitude: f64,
    longitude: f64,
    updated_at: Instant,
}

/// Current position of every active driver, keyed by [`DriverId`].
///
/// Each driver has at most one entry; an update overwrites the previous one. Entries are guarded
/// per shard, so concurrent updates to different drivers do not contend and an update and a query
/// touching the same driver never interleave.
#[derive(Debug)]
pub struct SpatialIndex {
    positions: DashMap<DriverId, Tracked, ahash::RandomState>,
}

impl SpatialIndex {
    /// Construct a new empty [`SpatialIndex`].
    pub fn new() -> SpatialIndex {
        Self::default()
    }

    /// Insert or overwrite the position of `driver_id`.
    pub fn update_position(
        &self,
        driver_id: DriverId,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), InvalidCoordinate> {
        self.update_position_at(driver_id, latitude, longitude, Instant::now())
    }

    /// Insert or overwrite the position of `driver_id`, recording `at` as the time of the update.
    pub fn update_position_at(
        &self,
        driver_id: DriverId,
        latitude: f64,
        longitude: f64,
        at: Instant,
    ) -> Result<(), InvalidCoordinate> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(InvalidCoordinate {
                driver_id,
                latitude,
                longitude,
            });
        }

        self.positions.insert(
            driver_id,
            Tracked {
                latitude,
                longitude,
                updated_at: at,
            },
        );
        Ok(())
    }

    /// The latest position of `driver_id`, if tracked.
    pub fn position(&self, driver_id: &DriverId) -> Option<DriverPosition> {
        self.positions.get(driver_id).map(|entry| DriverPosition {
            driver_id: entry.key().clone(),
            latitude: entry.latitude,
            longitude: entry.longitude,
        })
    }

    /// Stop tracking `driver_id`, returning its last position.
    pub fn remove(&self, driver_id: &DriverId) -> Option<DriverPosition> {
        self.positions
            .remove(driver_id)
            .map(|(driver_id, tracked)| DriverPosition {
                driver_id,
                latitude: tracked.latitude,
                longitude: tracked.longitude,
            })
    }

    /// Every driver within `radius_m` meters of the query point.
    ///
    /// The result is in index iteration order; callers must not rely on it.
    pub fn query_nearby(&self, latitude: f64, longitude: f64, radius_m: f64) -> Vec<DriverPosition> {
        self.positions
            .iter()
            .filter(|entry| {
                haversine_m(latitude, longitude, entry.latitude, entry.longitude) <= radius_m
            })
            .map(|entry| DriverPosition {
                driver_id: entry.key().clone(),
                latitude: entry.latitude,
                longitude: entry.longitude,
            })
            .collect()
    }

    /// Stop tracking `driver_id` only if its position was last updated before `cutoff`.
    pub fn remove_stale(&self, driver_id: &DriverId, cutoff: Instant) -> Option<DriverPosition> {
        self.positions
            .remove_if(driver_id, |_, tracked| tracked.updated_at < cutoff)
            .map(|(driver_id, tracked)| DriverPosition {
                driver_id,
                latitude: tracked.latitude,
                longitude: tracked.longitude,
            })
    }

    /// Remove every entry last updated before `cutoff`, returning the evicted drivers.
    pub fn evict_stale(&self, cutoff: Instant) -> Vec<DriverId> {
        let mut evicted = Vec::new();
        self.positions.retain(|driver_id, tracked| {
            let fresh = tracked.updated_at >= cutoff;
            if !fresh {
                evicted.push(driver_id.clone());
            }
            fresh
        });
        evicted
    }

    /// Number of tracked drivers.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self {
            positions: DashMap::default(),
        }
    }
}
