use std::collections::VecDeque;

use super::StateMachine;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection or the stream ended.
    Normal,
    /// The transport failed with the given error.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Open,
    Closed(CloseReason),
}

/// Tracks one connection through `Connecting -> Open -> Closed`.
///
/// `Closed` is terminal: any input received after it is dropped.
#[derive(Debug)]
pub struct LifecycleMachine {
    state: LifecycleState,
    pending: VecDeque<LifecycleOutput>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Connecting,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    fn handshake_complete(&mut self) {
        if self.state == LifecycleState::Connecting {
            self.state = LifecycleState::Open;
            self.pending.push_back(LifecycleOutput::Opened);
        }
    }

    fn close(&mut self, reason: CloseReason) {
        let was_open = match self.state {
            LifecycleState::Connecting => false,
            LifecycleState::Open => true,
            LifecycleState::Closed(_) => return,
        };
        self.state = LifecycleState::Closed(reason.clone());
        self.pending
            .push_back(LifecycleOutput::Closed { reason, was_open });
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleInput {
    HandshakeComplete,
    PeerClosed,
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutput {
    /// The session must be registered and greeted.
    Opened,
    /// The session must be released. `was_open` is false when the handshake never completed,
    /// in which case nothing was registered.
    Closed { reason: CloseReason, was_open: bool },
}

impl StateMachine for LifecycleMachine {
    type Input = LifecycleInput;
    type Output = LifecycleOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            LifecycleInput::HandshakeComplete => self.handshake_complete(),
            LifecycleInput::PeerClosed => self.close(CloseReason::Normal),
            LifecycleInput::TransportError(error) => self.close(CloseReason::Error(error)),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}
