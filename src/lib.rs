//! # Machina
//!
//! Concurrent finite-state-machine engine: declare states and
//! transitions, then drive state changes automatically (a background
//! control thread evaluates applicability) or manually (any thread may
//! trigger), with exit/entry side effects serialized by a chained
//! two-phase locking protocol.
//!
//! ## Core concepts
//!
//! - [`State`]: a named node with entry/exit/applicability hooks,
//!   shared by reference and compared by identity.
//! - [`Transition`]: a directed, possibly multi-source edge, manual or
//!   automatic; global transitions match any current state.
//! - [`StateMachine`]: owns the current state, the transition list, the
//!   chained locks and the control thread; exposes
//!   trigger/wait/halt/resume/reserve/when.
//! - [`MachineHooks`]: engine-level observer and error-recovery hooks.
//!
//! ## Concurrency model
//!
//! One background control thread plus any number of external caller
//! threads. All transition attempts funnel through the same protocol:
//! the outer lock covers validation and the outgoing `on_exit()`, the
//! inner lock covers the entry phase, and the chained handoff lets the
//! next transition's exit overlap the previous transition's entry while
//! two entries or two exits never overlap. Every blocking entry point
//! accepts non-blocking and timed variants.
//!
//! ## Example
//!
//! ```rust
//! use machina::{BasicState, FinalState, StateMachine, TransitionOptions};
//!
//! let sm = StateMachine::new(());
//! let a = BasicState::shared("A");
//! let b = BasicState::shared("B");
//! let done = FinalState::shared("Done");
//!
//! let a_to_b = sm.connect(&[a.clone()], b.clone()).unwrap();
//! sm.connect_with(&[b.clone()], done, TransitionOptions::automatic())
//!     .unwrap();
//! sm.set_initial_state(a);
//!
//! sm.start().unwrap();
//! a_to_b.trigger().unwrap();
//! sm.join(None).unwrap();
//! assert!(!sm.is_alive());
//! ```

pub mod error;
pub mod inspect;
pub mod logging;
pub mod machine;
pub mod state;
pub mod transition;

mod sync;

pub use error::{ErrorInfo, HookPhase, Result, StateMachineError};
pub use inspect::{MachineGraph, TransitionInfo};
pub use machine::{MachineHooks, StateMachine, UseGuard};
pub use state::{BasicState, FinalState, State, StateRef};
pub use transition::{
    SourceStates, Transition, TransitionCallback, TransitionGuard, TransitionHandle,
    TransitionOptions,
};
