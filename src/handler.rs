use std::fmt::Display;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{self, DecodeError, Inbound, LocationUpdate, Outbound, RideRequest};
use crate::session::error::{BindingConflict, SendError};
use crate::session::{Binding, ConnectionRegistry, Role, SessionId};
use crate::spatial_index::SpatialIndex;

/// What the handler did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A driver position was written to the index.
    Updated,
    /// A `nearbyDrivers` reply carrying `matches` drivers was queued.
    Replied { matches: usize },
    /// The envelope is not one the service handles; nothing was sent.
    Ignored,
    /// The frame could not be decoded; an `error` envelope was queued for the sender.
    Rejected,
}

/// Routes decoded envelopes from one session to the spatial index and answers on the same
/// session. Failures are reported to the sending session only.
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    index: Arc<SpatialIndex>,
    registry: Arc<ConnectionRegistry>,
    default_radius_m: f64,
}

impl ProtocolHandler {
    pub fn new(
        index: Arc<SpatialIndex>,
        registry: Arc<ConnectionRegistry>,
        default_radius_m: f64,
    ) -> Self {
        Self {
            index,
            registry,
            default_radius_m,
        }
    }

    /// Handle a text frame received on `session_id`.
    pub fn handle_frame(&self, session_id: &SessionId, text: &str) -> Dispatch {
        self.dispatch(session_id, protocol::decode(text))
    }

    /// Handle a binary frame received on `session_id`.
    pub fn handle_binary(&self, session_id: &SessionId, bytes: &[u8]) -> Dispatch {
        self.dispatch(session_id, protocol::decode_bytes(bytes))
    }

    fn dispatch(&self, session_id: &SessionId, decoded: Result<Inbound, DecodeError>) -> Dispatch {
        match decoded {
            Ok(Inbound::LocationUpdate(update)) => self.location_update(session_id, update),
            Ok(Inbound::RequestRide(request)) => self.request_ride(session_id, request),
            Ok(Inbound::Ignored { kind, role }) => {
                debug!(session_id = %session_id, ?kind, ?role, "Ignoring envelope");
                Dispatch::Ignored
            }
            Err(e) => self.reject(session_id, e),
        }
    }

    /// Only a session bound to `update.driver_id` may move that driver.
    fn location_update(&self, session_id: &SessionId, update: LocationUpdate) -> Dispatch {
        match self.bind(session_id, Role::Driver, Some(update.driver_id.as_str())) {
            Some(Binding::Bound | Binding::AlreadyBound) => {}
            Some(Binding::Conflicting {
                role,
                associated_id,
            }) => {
                return self.reject(session_id, BindingConflict { role, associated_id });
            }
            None => return Dispatch::Rejected,
        }

        if let Err(e) =
            self.index
                .update_position(update.driver_id.clone(), update.latitude, update.longitude)
        {
            return self.reject(session_id, e);
        }

        debug!(
            session_id = %session_id,
            driver_id = %update.driver_id,
            lat = update.latitude,
            lon = update.longitude,
            "Updated driver location"
        );
        Dispatch::Updated
    }

    fn request_ride(&self, session_id: &SessionId, request: RideRequest) -> Dispatch {
        self.bind(session_id, Role::Passenger, request.passenger_id.as_deref());

        let radius_m = request.radius_m.unwrap_or(self.default_radius_m);
        let drivers = self
            .index
            .query_nearby(request.latitude, request.longitude, radius_m);
        let matches = drivers.len();

        debug!(
            session_id = %session_id,
            lat = request.latitude,
            lon = request.longitude,
            radius_m,
            matches,
            "Answered ride request"
        );
        self.reply(session_id, Outbound::NearbyDrivers { drivers });
        Dispatch::Replied { matches }
    }

    /// Bind the session and log the outcome. `None` when the session is no longer registered.
    fn bind(
        &self,
        session_id: &SessionId,
        role: Role,
        associated_id: Option<&str>,
    ) -> Option<Binding> {
        let binding = match self.registry.bind(session_id, role, associated_id) {
            Ok(binding) => binding,
            Err(e) => {
                warn!(error = %e, "Cannot bind unregistered session");
                return None;
            }
        };

        match &binding {
            Binding::Bound => {
                debug!(session_id = %session_id, %role, ?associated_id, "Session bound");
            }
            Binding::AlreadyBound => {}
            Binding::Conflicting {
                role: bound_role,
                associated_id: bound_id,
            } => {
                debug!(
                    session_id = %session_id,
                    declared_role = %role,
                    ?associated_id,
                    %bound_role,
                    ?bound_id,
                    "Envelope declares a different identity than the session"
                );
            }
        }
        Some(binding)
    }

    fn reject(&self, session_id: &SessionId, error: impl Display) -> Dispatch {
        warn!(session_id = %session_id, error = %error, "Rejected inbound frame");
        self.reply(session_id, Outbound::error(error));
        Dispatch::Rejected
    }

    fn reply(&self, session_id: &SessionId, envelope: Outbound) {
        match self.registry.send(session_id, envelope) {
            Ok(()) => {}
            Err(e @ SendError::Full { .. }) => {
                warn!(error = %e, "Peer is not reading, dropped reply");
            }
            Err(e) => debug!(error = %e, "Dropped reply for departed session"),
        }
    }
}
