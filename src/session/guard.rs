use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{ConnectionHandle, ConnectionRegistry, Role, SessionId};
use crate::driver::DriverId;
use crate::spatial_index::SpatialIndex;

/// What happens to a driver's position when the session that reported it closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PositionRetention {
    /// Remove the position, unless another live session reports the same driver.
    #[default]
    ClearOnClose,
    /// Leave the position in the index until it goes stale.
    Keep,
}

/// Holds a registry slot for the lifetime of a connection.
///
/// Dropping the guard unregisters the session on every exit path of the connection task and
/// applies the [`PositionRetention`] policy to the driver bound to it.
#[derive(Debug)]
pub struct SessionGuard {
    session_id: SessionId,
    registry: Arc<ConnectionRegistry>,
    index: Arc<SpatialIndex>,
    retention: PositionRetention,
}

impl SessionGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl ConnectionRegistry {
    /// Register `handle` and return a guard that unregisters it when dropped.
    pub fn register_scoped(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        index: Arc<SpatialIndex>,
        retention: PositionRetention,
    ) -> SessionGuard {
        let session_id = self.register(handle);
        SessionGuard {
            session_id,
            registry: Arc::clone(self),
            index,
            retention,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let info = match self.registry.unregister(&self.session_id) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Session already unregistered");
                return;
            }
        };

        info!(
            session_id = %info.session_id,
            peer = %info.peer,
            role = ?info.role,
            dropped_envelopes = info.dropped_envelopes,
            "Session unregistered"
        );

        if self.retention == PositionRetention::Keep {
            return;
        }

        if let (Some(Role::Driver), Some(id)) = (info.role, info.associated_id) {
            let driver_id = DriverId::from(id);
            // A session binding the driver after this check can only write after `cutoff`,
            // and such a position is left in place.
            let cutoff = Instant::now();
            if self.registry.is_driver_bound(&driver_id, &self.session_id) {
                debug!(driver_id = %driver_id, "Driver reconnected elsewhere, keeping position");
                return;
            }
            if self.index.remove_stale(&driver_id, cutoff).is_some() {
                debug!(driver_id = %driver_id, "Cleared position of departed driver");
            }
        }
    }
}
