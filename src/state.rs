//! # State Capability Protocol
//!
//! States are trait objects shared by reference across every transition
//! that mentions them; the engine compares their identity, never their
//! name. Concrete states implement only the hooks they need.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared, identity-compared reference to a state.
pub type StateRef<C> = Arc<dyn State<C>>;

/// Lifecycle hooks for a state machine state.
///
/// All hooks take the machine's context as their sole argument and may
/// fail; the engine routes failures into its recovery path. Default
/// implementations make every hook a no-op so concrete states override
/// only what they need.
pub trait State<C>: Send + Sync {
    /// Display identifier, used for logging and diagnostics.
    fn name(&self) -> &str;

    /// Successful entry of a final state terminates the machine.
    fn is_final(&self) -> bool {
        false
    }

    /// Can the state be applied right now. Queried for automatic-transition
    /// candidacy and manual-trigger applicability, never for the initial
    /// state.
    fn is_applicable(&self, _context: &C) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Called after the state is recorded as current but before
    /// `on_entry()`. Intended for resetting per-activation flags; it
    /// should complete quickly.
    ///
    /// Runs even when the transition is superseded by an early
    /// `on_exit()` from an overlapping trigger, so interruptible states
    /// must tolerate exit-before-prepare ordering.
    fn prepare_entry(&self, _context: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Primary activation logic. May block for arbitrary durations; a
    /// long `on_entry()` only lengthens this transition's entry critical
    /// section, the next trigger's `on_exit()` can still begin.
    fn on_entry(&self, _context: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cleanup before leaving the state. A failure here aborts the
    /// transition before any state mutation.
    fn on_exit(&self, _context: &C) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Identity comparison for shared states. Name equality is irrelevant.
pub(crate) fn same_state<C>(a: &StateRef<C>, b: &StateRef<C>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

static STATE_COUNTER: AtomicUsize = AtomicUsize::new(1);
static FINAL_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Plain named state with default hooks.
#[derive(Debug)]
pub struct BasicState {
    name: String,
}

impl BasicState {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Unnamed state with an auto-incremented `S1`, `S2`, ... placeholder.
    pub fn unnamed() -> Self {
        let n = STATE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("S{n}"),
        }
    }

    /// Convenience constructor yielding a shared reference.
    pub fn shared<C>(name: impl Into<String>) -> StateRef<C> {
        Arc::new(Self::new(name))
    }
}

impl<C> State<C> for BasicState {
    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BasicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Terminal state. Successfully entering it stops the control loop.
#[derive(Debug)]
pub struct FinalState {
    name: String,
}

impl FinalState {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Unnamed final state with an auto-incremented `F1`, `F2`, ... name.
    pub fn unnamed() -> Self {
        let n = FINAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("F{n}"),
        }
    }

    /// Convenience constructor yielding a shared reference.
    pub fn shared<C>(name: impl Into<String>) -> StateRef<C> {
        Arc::new(Self::new(name))
    }
}

impl<C> State<C> for FinalState {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_final(&self) -> bool {
        true
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_generated_names() {
        let a: StateRef<()> = Arc::new(BasicState::unnamed());
        let b: StateRef<()> = Arc::new(BasicState::unnamed());
        assert!(a.name().starts_with('S'));
        assert!(b.name().starts_with('S'));
        assert_ne!(a.name(), b.name());

        let f: StateRef<()> = Arc::new(FinalState::unnamed());
        assert!(f.name().starts_with('F'));
    }

    #[test]
    fn test_explicit_names() {
        let a: StateRef<()> = BasicState::shared("A");
        assert_eq!(a.name(), "A");
        assert!(!a.is_final());

        let f: StateRef<()> = FinalState::shared("Done");
        assert_eq!(f.name(), "Done");
        assert!(f.is_final());
    }

    #[test]
    fn test_identity_comparison() {
        let a: StateRef<()> = BasicState::shared("A");
        let also_a = a.clone();
        let other: StateRef<()> = BasicState::shared("A");

        assert!(same_state(&a, &also_a));
        // Same name, different instance.
        assert!(!same_state(&a, &other));
    }

    #[test]
    fn test_default_hooks() {
        let a: StateRef<i32> = BasicState::shared("A");
        assert!(a.is_applicable(&0).unwrap());
        a.prepare_entry(&0).unwrap();
        a.on_entry(&0).unwrap();
        a.on_exit(&0).unwrap();
    }
}
