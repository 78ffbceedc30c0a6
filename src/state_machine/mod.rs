pub mod lifecycle;

/// A deterministic state machine driven by a runner that owns all side effects.
///
/// # Functionality
/// Inputs are fed through [`process_input`](StateMachine::process_input) and the resulting
/// effects are drained with [`poll_output`](StateMachine::poll_output). The runner (for example a
/// connection task) decides how each output is carried out: registering a session, writing a
/// frame, logging. The machine itself only records what must happen next.
///
/// Grouping every kind of input and output into the [`Input`](StateMachine::Input) and
/// [`Output`](StateMachine::Output) associated types keeps dispatch in one place, so the inherent
/// methods of the machine stay focused on the transition logic.
///
/// # Invariants
/// Implementors must be pure, so that the same input sequence always produces the same output
/// sequence and the machine can be tested without a runtime:
///
/// * No interior mutability and no shared ownership (`Cell`, `Mutex`, `Arc`, ...). State changes
///   only through `&mut self`.
/// * No I/O, no reads of the system clock and no system entropy. Time and randomness, when
///   needed, arrive as input.
/// * No threads, no async and no blocking.
///
/// Logging and metrics are tolerated as side effects as long as the transition logic never
/// depends on their outcome.
///
/// # Example
/// ```ignore
/// let mut machine = LifecycleMachine::new();
/// machine.process_input(LifecycleInput::HandshakeComplete);
///
/// while let Some(output) = machine.poll_output() {
///     match output {
///         LifecycleOutput::Opened => { /* register the session, send welcome */ }
///         LifecycleOutput::Closed { .. } => { /* release the session */ }
///     }
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) from the state machine.
    type Output;

    /// Process the provided `input`, mapping it onto the matching transition of the machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the oldest pending output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
