//! # Transitions
//!
//! A transition is a plain data record: a source-state set (specific or
//! wildcard), one target state, an automatic flag, an optional callback
//! and an optional per-edge applicability guard. The trigger capability
//! lives in a separate handle bound to the owning engine at registration
//! time; the record itself never changes shape after construction.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{Result, StateMachineError};
use crate::machine::MachineCore;
use crate::state::{same_state, StateRef};
use crate::sync::Wait;

/// Callback invoked between exit of the old state and entry of the new one.
pub type TransitionCallback<C> = Box<dyn Fn(&C) -> anyhow::Result<()> + Send + Sync>;

/// Per-edge applicability override.
pub type TransitionGuard<C> = Box<dyn Fn(&C) -> anyhow::Result<bool> + Send + Sync>;

/// Source-state set of a transition.
///
/// The wildcard is an explicit variant, not a magic state that compares
/// equal to everything.
pub enum SourceStates<C> {
    /// Eligible from these states only. Order is preserved for
    /// diagnostics; membership is what matters.
    Specific(Vec<StateRef<C>>),
    /// Global transition, eligible from any current state.
    Any,
}

impl<C> SourceStates<C> {
    pub fn contains(&self, state: &StateRef<C>) -> bool {
        match self {
            Self::Any => true,
            Self::Specific(states) => states.iter().any(|s| same_state(s, state)),
        }
    }
}

/// Optional transition attributes for `connect_with`.
pub struct TransitionOptions<C> {
    /// Label, auto-generated (`T1`, `T2`, ...) when absent.
    pub name: Option<String>,
    /// Evaluated and fired by the control loop without external request.
    pub automatic: bool,
    /// Invoked with the context after `on_exit()` of the old state.
    pub callback: Option<TransitionCallback<C>>,
    /// Replaces the default delegation to the target state's
    /// `is_applicable()`.
    pub guard: Option<TransitionGuard<C>>,
}

impl<C> Default for TransitionOptions<C> {
    fn default() -> Self {
        Self {
            name: None,
            automatic: false,
            callback: None,
            guard: None,
        }
    }
}

impl<C> TransitionOptions<C> {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn automatic() -> Self {
        Self {
            automatic: true,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_callback(
        mut self,
        callback: impl Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_guard(
        mut self,
        guard: impl Fn(&C) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

static TRANSITION_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// A directed, possibly multi-source edge between states.
pub struct Transition<C> {
    sources: SourceStates<C>,
    target: StateRef<C>,
    automatic: bool,
    name: String,
    callback: Option<TransitionCallback<C>>,
    guard: Option<TransitionGuard<C>>,
}

impl<C> Transition<C> {
    pub(crate) fn new(
        sources: SourceStates<C>,
        target: StateRef<C>,
        options: TransitionOptions<C>,
    ) -> Result<Self> {
        if let SourceStates::Specific(states) = &sources {
            if states.is_empty() {
                return Err(StateMachineError::Configuration(
                    "transition requires at least one source state".to_string(),
                ));
            }
        }
        let name = options.name.unwrap_or_else(|| {
            format!("T{}", TRANSITION_COUNTER.fetch_add(1, Ordering::Relaxed))
        });
        Ok(Self {
            sources,
            target,
            automatic: options.automatic,
            name,
            callback: options.callback,
            guard: options.guard,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn target(&self) -> &StateRef<C> {
        &self.target
    }

    pub fn sources(&self) -> &SourceStates<C> {
        &self.sources
    }

    /// Source names for diagnostics; `["*"]` for a global transition.
    pub fn source_names(&self) -> Vec<String> {
        match &self.sources {
            SourceStates::Any => vec!["*".to_string()],
            SourceStates::Specific(states) => {
                states.iter().map(|s| s.name().to_string()).collect()
            }
        }
    }

    /// Is the transition possible from the given state.
    pub fn can_transition_from(&self, state: &StateRef<C>) -> bool {
        self.sources.contains(state)
    }

    /// Can the transition be applied right now. Uses the per-edge guard
    /// when set, otherwise delegates to the target state.
    pub fn is_applicable(&self, context: &C) -> anyhow::Result<bool> {
        match &self.guard {
            Some(guard) => guard(context),
            None => self.target.is_applicable(context),
        }
    }

    /// Does the transition mention the state at either endpoint.
    pub(crate) fn mentions(&self, state: &StateRef<C>) -> bool {
        match &self.sources {
            SourceStates::Any => true,
            SourceStates::Specific(states) => {
                states.iter().any(|s| same_state(s, state)) || same_state(&self.target, state)
            }
        }
    }

    pub(crate) fn run_callback(&self, context: &C) -> anyhow::Result<()> {
        if let Some(callback) = &self.callback {
            callback(context)?;
        }
        Ok(())
    }
}

impl<C> fmt::Display for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.automatic { "auto" } else { "manual" };
        write!(f, "{} [{mode}]", self.name)
    }
}

impl<C> fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("from", &self.source_names())
            .field("to", &self.target.name())
            .field("automatic", &self.automatic)
            .finish()
    }
}

/// Trigger capability bound to the owning engine at registration time.
///
/// Holds the engine weakly so stored handles cannot keep a dropped
/// machine alive; triggering after the machine is gone fails with
/// [`StateMachineError::NotAlive`].
pub struct TransitionHandle<C> {
    core: Weak<MachineCore<C>>,
    transition: Arc<Transition<C>>,
}

impl<C> Clone for TransitionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transition: self.transition.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> TransitionHandle<C> {
    pub(crate) fn new(core: Weak<MachineCore<C>>, transition: Arc<Transition<C>>) -> Self {
        Self { core, transition }
    }

    /// Trigger the transition, blocking until the engine is available.
    pub fn trigger(&self) -> Result<()> {
        self.trigger_wait(Wait::Indefinite)
    }

    /// Trigger without blocking; fails with `Busy` when another trigger
    /// or reservation holds the engine.
    pub fn try_trigger(&self) -> Result<()> {
        self.trigger_wait(Wait::NoWait)
    }

    /// Trigger, waiting at most `timeout` for the engine; fails with
    /// `Busy` on expiry.
    pub fn trigger_timeout(&self, timeout: Duration) -> Result<()> {
        self.trigger_wait(Wait::Timeout(timeout))
    }

    fn trigger_wait(&self, wait: Wait) -> Result<()> {
        let core = self.core.upgrade().ok_or(StateMachineError::NotAlive)?;
        core.trigger(&self.transition, wait)
    }

    /// The underlying transition record.
    pub fn transition(&self) -> &Arc<Transition<C>> {
        &self.transition
    }
}
