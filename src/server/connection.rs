use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::handler::ProtocolHandler;
use crate::protocol::Outbound;
use crate::session::{
    ConnectionHandle, ConnectionRegistry, PositionRetention, SessionGuard, SessionId,
};
use crate::spatial_index::SpatialIndex;
use crate::state_machine::StateMachine;
use crate::state_machine::lifecycle::{
    CloseReason, LifecycleInput, LifecycleMachine, LifecycleOutput,
};

/// Everything a connection task needs from the server.
#[derive(Debug, Clone)]
pub(super) struct ConnectionContext {
    pub handler: ProtocolHandler,
    pub registry: Arc<ConnectionRegistry>,
    pub index: Arc<SpatialIndex>,
    pub retention: PositionRetention,
    pub service_name: Arc<str>,
    pub outbound_capacity: usize,
}

/// Runs the lifecycle outputs of one connection against the shared state.
struct Connection {
    peer: SocketAddr,
    context: ConnectionContext,
    lifecycle: LifecycleMachine,
    outbound: Option<mpsc::Sender<Outbound>>,
    guard: Option<SessionGuard>,
}

impl Connection {
    fn new(peer: SocketAddr, context: ConnectionContext) -> Self {
        Self {
            peer,
            context,
            lifecycle: LifecycleMachine::new(),
            outbound: None,
            guard: None,
        }
    }

    fn session_id(&self) -> Option<&SessionId> {
        self.guard.as_ref().map(SessionGuard::session_id)
    }

    fn feed(&mut self, input: LifecycleInput) {
        self.lifecycle.process_input(input);
        while let Some(output) = self.lifecycle.poll_output() {
            match output {
                LifecycleOutput::Opened => self.open(),
                LifecycleOutput::Closed { reason, was_open } => self.close(reason, was_open),
            }
        }
    }

    fn open(&mut self) {
        let Some(outbound) = self.outbound.take() else {
            warn!(peer = %self.peer, "Connection opened without an outbound channel");
            return;
        };

        let guard = self.context.registry.register_scoped(
            ConnectionHandle::new(self.peer, outbound),
            Arc::clone(&self.context.index),
            self.context.retention,
        );
        info!(session_id = %guard.session_id(), peer = %self.peer, "Session opened");

        let welcome = Outbound::welcome(&self.context.service_name);
        if let Err(e) = self.context.registry.send(guard.session_id(), welcome) {
            warn!(session_id = %guard.session_id(), error = %e, "Failed to queue welcome");
        }
        self.guard = Some(guard);
    }

    fn close(&mut self, reason: CloseReason, was_open: bool) {
        match &reason {
            CloseReason::Normal => {
                info!(peer = %self.peer, "Connection closed");
            }
            CloseReason::Error(error) if was_open => {
                warn!(peer = %self.peer, error = %error, "Connection failed");
            }
            CloseReason::Error(error) => {
                warn!(peer = %self.peer, error = %error, "WebSocket handshake failed");
            }
        }
        // Unregisters the session and applies the retention policy.
        self.guard.take();
        self.outbound.take();
    }
}

/// Serve one accepted TCP stream until the peer leaves or the transport fails.
pub(super) async fn serve_connection(stream: TcpStream, peer: SocketAddr, context: ConnectionContext) {
    let handler = context.handler.clone();
    let outbound_capacity = context.outbound_capacity;
    let mut connection = Connection::new(peer, context);

    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            connection.feed(LifecycleInput::TransportError(e.to_string()));
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(outbound_capacity);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            if let Err(e) = ws_write.send(Message::text(text)).await {
                debug!(peer = %peer, error = %e, "Writer stopped");
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    connection.outbound = Some(tx);
    connection.feed(LifecycleInput::HandshakeComplete);

    let Some(session_id) = connection.session_id().cloned() else {
        connection.feed(LifecycleInput::PeerClosed);
        let _ = writer.await;
        return;
    };

    let ending = loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => {
                let dispatch = handler.handle_frame(&session_id, text.as_str());
                debug!(session_id = %session_id, ?dispatch, "Handled text frame");
            }
            Some(Ok(Message::Binary(bytes))) => {
                let dispatch = handler.handle_binary(&session_id, &bytes);
                debug!(session_id = %session_id, ?dispatch, "Handled binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(session_id = %session_id, ?frame, "Peer sent close");
                break LifecycleInput::PeerClosed;
            }
            // Pings are answered by the transport.
            Some(Ok(_)) => {}
            Some(Err(e)) => break LifecycleInput::TransportError(e.to_string()),
            None => break LifecycleInput::PeerClosed,
        }
    };

    connection.feed(ending);
    drop(connection);

    if let Err(e) = writer.await {
        warn!(session_id = %session_id, error = %e, "Writer task failed");
    }
}
