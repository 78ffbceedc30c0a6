pub mod error;
pub mod guard;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::driver::DriverId;
use crate::protocol::Outbound;

use self::error::{SendError, SessionNotFound};
pub use self::guard::{PositionRetention, SessionGuard};

#[derive(Clone, Hash, PartialEq, Eq)]
pub struct SessionId(Arc<Uuid>);

impl SessionId {
    pub fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a peer declares for itself. Nothing verifies the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Driver,
    Passenger,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Driver => f.write_str("driver"),
            Role::Passenger => f.write_str("passenger"),
        }
    }
}

/// The sending half of a live connection: envelopes queued here are written to that peer only.
///
/// The queue is bounded; a peer that stops reading loses envelopes instead of growing it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { peer, outbound }
    }
}

#[derive(Debug)]
struct Session {
    handle: ConnectionHandle,
    role: Option<Role>,
    associated_id: Option<String>,
    /// Envelopes dropped because the outbound queue was full.
    dropped: AtomicU64,
}

impl Session {
    fn info(&self, session_id: SessionId) -> SessionInfo {
        SessionInfo {
            session_id,
            peer: self.handle.peer,
            role: self.role,
            associated_id: self.associated_id.clone(),
            dropped_envelopes: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub role: Option<Role>,
    pub associated_id: Option<String>,
    pub dropped_envelopes: u64,
}

/// Outcome of [`ConnectionRegistry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// The session now carries the declared role and identity.
    Bound,
    /// The session already carried exactly this declaration.
    AlreadyBound,
    /// The session was bound to something else first and keeps that binding.
    Conflicting {
        role: Role,
        associated_id: Option<String>,
    },
}

/// Live streaming sessions, keyed by a [`SessionId`] generated at registration.
///
/// Role and identity are unknown when a connection opens; they are bound by the first envelope
/// that declares them and stay fixed for the lifetime of the session.
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Session, ahash::RandomState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::default(),
        }
    }

    /// Register a newly opened connection and return the id of its session.
    pub fn register(&self, handle: ConnectionHandle) -> SessionId {
        let session_id = SessionId::generate();
        self.sessions.insert(
            session_id.clone(),
            Session {
                handle,
                role: None,
                associated_id: None,
                dropped: AtomicU64::new(0),
            },
        );
        session_id
    }

    pub fn unregister(&self, session_id: &SessionId) -> Result<SessionInfo, SessionNotFound> {
        self.sessions
            .remove(session_id)
            .map(|(session_id, session)| session.info(session_id))
            .ok_or_else(|| SessionNotFound {
                session_id: session_id.clone(),
            })
    }

    /// Record the role and identity a session declared.
    ///
    /// An identity may be filled in later for a session bound without one, but a bound role or
    /// identity is never replaced.
    pub fn bind(
        &self,
        session_id: &SessionId,
        role: Role,
        associated_id: Option<&str>,
    ) -> Result<Binding, SessionNotFound> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionNotFound {
                session_id: session_id.clone(),
            })?;

        let current = session.associated_id.clone();
        let binding = match (session.role, current.as_deref(), associated_id) {
            (None, _, declared) => {
                session.role = Some(role);
                session.associated_id = declared.map(str::to_string);
                Binding::Bound
            }
            (Some(bound), None, Some(declared)) if bound == role => {
                session.associated_id = Some(declared.to_string());
                Binding::Bound
            }
            (Some(bound), _, None) if bound == role => Binding::AlreadyBound,
            (Some(bound), Some(current), Some(declared)) if bound == role && current == declared => {
                Binding::AlreadyBound
            }
            (Some(bound), current, _) => Binding::Conflicting {
                role: bound,
                associated_id: current.map(str::to_string),
            },
        };
        Ok(binding)
    }

    /// Queue `envelope` for delivery on the session's connection only.
    ///
    /// Never waits: when the session's queue is full the envelope is dropped, counted, and
    /// [`SendError::Full`] is returned.
    pub fn send(&self, session_id: &SessionId, envelope: Outbound) -> Result<(), SendError> {
        let session = self.sessions.get(session_id).ok_or_else(|| SessionNotFound {
            session_id: session_id.clone(),
        })?;

        match session.handle.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                session.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full {
                    session_id: session_id.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(SendError::ConnectionClosed {
                session_id: session_id.clone(),
            }),
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.info(entry.key().clone()))
    }

    /// Whether a live session other than `excluding` is bound to `driver_id`.
    pub fn is_driver_bound(&self, driver_id: &DriverId, excluding: &SessionId) -> bool {
        self.sessions.iter().any(|entry| {
            entry.key() != excluding
                && entry.role == Some(Role::Driver)
                && entry.associated_id.as_deref() == Some(driver_id.as_str())
        })
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(([127, 0, 0, 1], 4000).into(), tx), rx)
    }

    #[test]
    fn test_register_session() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = handle();

        let session_id = registry.register(handle);
        assert_eq!(registry.active_session_count(), 1);

        let info = registry.get(&session_id).unwrap();
        assert_eq!(info.role, None);
        assert_eq!(info.associated_id, None);
    }

    #[test]
    fn test_each_registration_gets_a_new_session() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();

        let a = registry.register(first);
        let b = registry.register(second);
        assert_ne!(a, b);
        assert_eq!(registry.active_session_count(), 2);
    }

    #[test]
    fn test_unregister_session() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = handle();
        let session_id = registry.register(handle);

        let removed = registry.unregister(&session_id).unwrap();
        assert_eq!(removed.session_id, session_id);
        assert_eq!(registry.active_session_count(), 0);

        // Second attempt should fail
        let result = registry.unregister(&session_id);
        assert!(matches!(result.unwrap_err(), SessionNotFound { .. }));
    }

    #[test]
    fn test_bind_first_declaration_wins() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = handle();
        let session_id = registry.register(handle);

        let first = registry.bind(&session_id, Role::Driver, Some("d1")).unwrap();
        assert_eq!(first, Binding::Bound);

        let repeat = registry.bind(&session_id, Role::Driver, Some("d1")).unwrap();
        assert_eq!(repeat, Binding::AlreadyBound);

        let other = registry.bind(&session_id, Role::Driver, Some("d2")).unwrap();
        assert_eq!(
            other,
            Binding::Conflicting {
                role: Role::Driver,
                associated_id: Some("d1".to_string()),
            }
        );

        let info = registry.get(&session_id).unwrap();
        assert_eq!(info.role, Some(Role::Driver));
        assert_eq!(info.associated_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_bind_fills_in_missing_identity() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = handle();
        let session_id = registry.register(handle);

        registry.bind(&session_id, Role::Passenger, None).unwrap();
        assert_eq!(
            registry.bind(&session_id, Role::Passenger, None).unwrap(),
            Binding::AlreadyBound
        );
        assert_eq!(
            registry.bind(&session_id, Role::Passenger, Some("u1")).unwrap(),
            Binding::Bound
        );
        assert!(matches!(
            registry.bind(&session_id, Role::Driver, Some("u1")).unwrap(),
            Binding::Conflicting { role: Role::Passenger, .. }
        ));
    }

    #[test]
    fn test_bind_unknown_session() {
        let registry = ConnectionRegistry::new();
        let result = registry.bind(&SessionId::generate(), Role::Driver, Some("d1"));
        assert!(result.is_err());
    }

    #[test]
    fn test_send_reaches_only_target_session() {
        let registry = ConnectionRegistry::new();
        let (first, mut rx1) = handle();
        let (second, mut rx2) = handle();
        let a = registry.register(first);
        let _b = registry.register(second);

        registry
            .send(
                &a,
                Outbound::Error {
                    message: "boom".to_string(),
                },
            )
            .unwrap();

        assert!(matches!(rx1.try_recv(), Ok(Outbound::Error { .. })));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_send_to_closed_connection() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = handle();
        let session_id = registry.register(handle);
        drop(rx);

        let result = registry.send(
            &session_id,
            Outbound::Welcome {
                message: "hi".to_string(),
            },
        );
        assert!(matches!(result, Err(SendError::ConnectionClosed { .. })));
    }

    #[test]
    fn test_send_to_unknown_session() {
        let registry = ConnectionRegistry::new();
        let result = registry.send(
            &SessionId::generate(),
            Outbound::Welcome {
                message: "hi".to_string(),
            },
        );
        assert!(matches!(result, Err(SendError::SessionNotFound(_))));
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(2);
        let session_id = registry.register(ConnectionHandle::new(([127, 0, 0, 1], 4000).into(), tx));

        for _ in 0..2 {
            registry.send(&session_id, Outbound::error("queued")).unwrap();
        }
        for _ in 0..3 {
            let result = registry.send(&session_id, Outbound::error("dropped"));
            assert!(matches!(result, Err(SendError::Full { .. })));
        }

        assert_eq!(registry.get(&session_id).unwrap().dropped_envelopes, 3);

        // Draining makes room again
        assert!(rx.try_recv().is_ok());
        registry.send(&session_id, Outbound::error("after drain")).unwrap();
        assert_eq!(registry.unregister(&session_id).unwrap().dropped_envelopes, 3);
    }

    #[test]
    fn test_driver_bound_elsewhere() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let old = registry.register(first);
        let new = registry.register(second);
        let driver = DriverId::from("d1");

        registry.bind(&old, Role::Driver, Some("d1")).unwrap();
        assert!(!registry.is_driver_bound(&driver, &old));

        registry.bind(&new, Role::Driver, Some("d1")).unwrap();
        assert!(registry.is_driver_bound(&driver, &old));
    }
}
