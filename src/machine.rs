//! # State Machine Engine
//!
//! Owns the current state, the registered transition list, the chained
//! lock pair and the control thread. Every state change, automatic or
//! manual, funnels through the same trigger protocol:
//!
//! 1. Acquire the outer lock (blocking, non-blocking or timed).
//! 2. Validate: alive, not halted, transition eligible from the current
//!    state.
//! 3. Run `on_exit()` of the current state.
//! 4. Acquire the inner lock.
//! 5. Run the transition callback.
//! 6. Swap the current-state pointer.
//! 7. Release the outer lock, so the next trigger's `on_exit()` may
//!    overlap this trigger's entry phase.
//! 8. Run `prepare_entry()`, notify state-changed waiters, run the
//!    `on_state_changed` observer hook.
//! 9. Run `on_entry()`, then the `on_state_applied` observer hook,
//!    release the inner lock and wake the scheduler.
//!
//! The chained handoff keeps entries and exits pairwise serialized while
//! letting exit(N+1) begin while entry(N) is still running. That overlap
//! is what lets an external thread interrupt a long `on_entry()` by
//! changing state, provided the outgoing state's `on_exit()` signals the
//! in-progress entry to unblock.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::error::{ErrorInfo, HookPhase, Result, StateMachineError};
use crate::inspect::{MachineGraph, TransitionInfo};
use crate::state::{same_state, StateRef};
use crate::sync::{Flag, InnerLock, Notifier, OuterLock, Wait};
use crate::transition::{SourceStates, Transition, TransitionHandle, TransitionOptions};

/// Bounded waits used by the control loop so stop/halt/resume are always
/// noticed even if a notification is lost to a race.
const HALTED_POLL: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_millis(500);
const BUSY_POLL: Duration = Duration::from_millis(50);

/// Engine-level overridable hooks.
///
/// All methods have default implementations; implement only what you
/// need. Observer hooks (`on_state_changed`, `on_state_applied`) run on
/// the control path but their failures are logged and swallowed, never
/// aborting a transition.
pub trait MachineHooks<C>: Send + Sync {
    /// Called during `start()`, before the initial state's entry hook.
    fn on_start(&self, _machine: &StateMachine<C>) {}

    /// Called by the control thread right before it terminates.
    fn on_exit(&self, _machine: &StateMachine<C>) {}

    /// Called after the state pointer has changed but before the new
    /// state's `on_entry()`.
    fn on_state_changed(
        &self,
        _machine: &StateMachine<C>,
        _from: &StateRef<C>,
        _to: &StateRef<C>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a state's `on_entry()` completed successfully.
    fn on_state_applied(
        &self,
        _machine: &StateMachine<C>,
        _state: &StateRef<C>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a transition callback, `prepare_entry()` or
    /// `on_entry()` fails. The machine is already halted. Returning a
    /// state installs it directly as current (a forced recovery jump,
    /// not a transition); the handler may also `resume()` the machine.
    /// The original error still reaches the triggering caller.
    fn handle_error(
        &self,
        _machine: &StateMachine<C>,
        _info: &ErrorInfo,
    ) -> anyhow::Result<Option<StateRef<C>>> {
        Ok(None)
    }
}

/// No-op hooks used by [`StateMachine::new`].
struct DefaultHooks;

impl<C> MachineHooks<C> for DefaultHooks {}

pub(crate) struct MachineCore<C> {
    context: C,
    hooks: Box<dyn MachineHooks<C>>,
    outer: OuterLock,
    inner: InnerLock,
    current: RwLock<Option<StateRef<C>>>,
    initial: RwLock<Option<StateRef<C>>>,
    transitions: RwLock<Vec<Arc<Transition<C>>>>,
    /// Cleared while halted.
    run: AtomicBool,
    /// Set once stopping; terminal.
    stop: AtomicBool,
    started: AtomicBool,
    /// Set by the control thread on termination; backs `join()`.
    done: Flag,
    /// Wakes external `wait()`/`wait_next_state()` callers.
    state_changed: Notifier,
    /// Wakes the control loop after triggers and lifecycle changes.
    scheduler: Notifier,
    control: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Concurrent finite-state-machine engine.
///
/// Cheap to clone; clones share the same underlying machine, so hooks
/// and worker threads can hold their own handle.
pub struct StateMachine<C> {
    core: Arc<MachineCore<C>>,
}

impl<C> Clone for StateMachine<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> StateMachine<C> {
    /// Create an idle machine owning `context`.
    pub fn new(context: C) -> Self {
        Self::with_hooks(context, DefaultHooks)
    }

    /// Create an idle machine with custom engine-level hooks.
    pub fn with_hooks(context: C, hooks: impl MachineHooks<C> + 'static) -> Self {
        Self {
            core: Arc::new(MachineCore {
                context,
                hooks: Box::new(hooks),
                outer: OuterLock::new(),
                inner: InnerLock::new(),
                current: RwLock::new(None),
                initial: RwLock::new(None),
                transitions: RwLock::new(Vec::new()),
                run: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
                done: Flag::new(),
                state_changed: Notifier::new(),
                scheduler: Notifier::new(),
                control: Mutex::new(None),
            }),
        }
    }

    // ---- setup ----

    /// Designate the state the machine starts in. Must be called before
    /// `start()`.
    pub fn set_initial_state(&self, state: StateRef<C>) {
        *self.core.initial.write() = Some(state);
    }

    pub fn initial_state(&self) -> Option<StateRef<C>> {
        self.core.initial.read().clone()
    }

    /// Connect states with a manual transition using default options.
    ///
    /// The returned handle is the trigger capability for the new edge.
    pub fn connect(
        &self,
        from_states: &[StateRef<C>],
        to_state: StateRef<C>,
    ) -> Result<TransitionHandle<C>> {
        self.connect_with(from_states, to_state, TransitionOptions::default())
    }

    /// Connect states with explicit options (name, automatic flag,
    /// callback, guard).
    pub fn connect_with(
        &self,
        from_states: &[StateRef<C>],
        to_state: StateRef<C>,
        options: TransitionOptions<C>,
    ) -> Result<TransitionHandle<C>> {
        let transition = Transition::new(
            SourceStates::Specific(from_states.to_vec()),
            to_state,
            options,
        )?;
        Ok(self.register(transition))
    }

    /// Connect a global transition, eligible from any current state.
    pub fn connect_global(&self, to_state: StateRef<C>) -> Result<TransitionHandle<C>> {
        self.connect_global_with(to_state, TransitionOptions::default())
    }

    pub fn connect_global_with(
        &self,
        to_state: StateRef<C>,
        options: TransitionOptions<C>,
    ) -> Result<TransitionHandle<C>> {
        let transition = Transition::new(SourceStates::Any, to_state, options)?;
        Ok(self.register(transition))
    }

    fn register(&self, transition: Transition<C>) -> TransitionHandle<C> {
        let transition = Arc::new(transition);
        self.core.transitions.write().push(transition.clone());
        TransitionHandle::new(Arc::downgrade(&self.core), transition)
    }

    // ---- introspection ----

    pub fn context(&self) -> &C {
        &self.core.context
    }

    /// Current state; `None` until `start()`.
    pub fn state(&self) -> Option<StateRef<C>> {
        self.core.current_state()
    }

    /// Is the machine currently in the given state (by identity).
    pub fn is_in(&self, state: &StateRef<C>) -> bool {
        self.core.in_any(std::slice::from_ref(state))
    }

    /// Registered transitions in registration order.
    pub fn transitions(&self) -> Vec<Arc<Transition<C>>> {
        self.core.transitions.read().clone()
    }

    /// Read-only snapshot of the state graph for inspection tooling.
    pub fn graph(&self) -> MachineGraph {
        let transitions = self.core.transitions.read();
        let mut seen: Vec<StateRef<C>> = Vec::new();
        let mut remember = |state: &StateRef<C>, seen: &mut Vec<StateRef<C>>| {
            if !seen.iter().any(|s| same_state(s, state)) {
                seen.push(state.clone());
            }
        };
        let mut rows = Vec::with_capacity(transitions.len());
        for t in transitions.iter() {
            if let SourceStates::Specific(states) = t.sources() {
                for s in states {
                    remember(s, &mut seen);
                }
            }
            remember(t.target(), &mut seen);
            rows.push(TransitionInfo {
                name: t.name().to_string(),
                from: t.source_names(),
                to: t.target().name().to_string(),
                automatic: t.is_automatic(),
            });
        }
        MachineGraph {
            initial: self.initial_state().map(|s| s.name().to_string()),
            states: seen.iter().map(|s| s.name().to_string()).collect(),
            transitions: rows,
        }
    }

    /// True once started and until the control thread has terminated.
    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// True while automatic scheduling and manual triggers are suspended
    /// pending `resume()`.
    pub fn is_halted(&self) -> bool {
        self.core.is_halted()
    }

    // ---- lifecycle ----

    /// Start the machine: record the initial state, run its `on_entry()`
    /// synchronously in the calling thread and spawn the control thread.
    /// The `on_state_changed` hook is not called for the initial state.
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    /// Request termination. Idempotent once stopping.
    pub fn stop(&self) -> Result<()> {
        self.core.stop()
    }

    /// Suspend automatic scheduling and manual triggers.
    pub fn halt(&self) -> Result<()> {
        debug!("halt state machine");
        if !self.core.is_alive() {
            return Err(StateMachineError::NotAlive);
        }
        self.core.run.store(false, Ordering::Release);
        self.core.scheduler.notify_all();
        Ok(())
    }

    /// Clear the halted flag. Retries nothing by itself; the next
    /// scheduler tick or manual trigger proceeds normally.
    pub fn resume(&self) -> Result<()> {
        debug!("resume state machine");
        if !self.core.is_alive() {
            return Err(StateMachineError::NotAlive);
        }
        self.core.run.store(true, Ordering::Release);
        self.core.scheduler.notify_all();
        Ok(())
    }

    /// Wait for the machine to complete. Returns false if `timeout`
    /// elapsed first.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool> {
        debug!("waiting for state machine completion");
        if !self.core.started.load(Ordering::Acquire) {
            return Err(StateMachineError::NotAlive);
        }
        let finished = self.core.done.wait_set(timeout);
        if finished {
            if let Some(handle) = self.core.control.lock().take() {
                let _ = handle.join();
            }
        }
        Ok(finished)
    }

    // ---- triggering ----

    /// Trigger a transition, blocking until the engine is available.
    pub fn trigger(&self, transition: &Arc<Transition<C>>) -> Result<()> {
        self.core.trigger(transition, Wait::Indefinite)
    }

    /// Trigger without blocking; `Busy` when the engine is held.
    pub fn try_trigger(&self, transition: &Arc<Transition<C>>) -> Result<()> {
        self.core.trigger(transition, Wait::NoWait)
    }

    /// Trigger with a bounded wait for the engine; `Busy` on expiry.
    pub fn trigger_timeout(
        &self,
        transition: &Arc<Transition<C>>,
        timeout: Duration,
    ) -> Result<()> {
        self.core.trigger(transition, Wait::Timeout(timeout))
    }

    // ---- waiting and reservation ----

    /// Block until the machine is in one of `states`. Returns false if
    /// `timeout` elapsed first. A zero timeout degenerates to an
    /// immediate membership test.
    pub fn wait(&self, states: &[StateRef<C>], timeout: Option<Duration>) -> bool {
        self.core.wait(states, timeout)
    }

    /// Wait for exactly one state-changed notification cycle. Returns
    /// false on timeout.
    pub fn wait_next_state(&self, timeout: Option<Duration>) -> bool {
        self.core.state_changed.wait(timeout)
    }

    /// Reserve the machine for the calling thread. While the guard is
    /// held no other thread, the control loop included, can begin a
    /// trigger; triggers from the owning thread still work.
    pub fn reserve(&self) -> Result<UseGuard<'_, C>> {
        self.reserve_wait(Wait::Indefinite)
    }

    /// Non-blocking reservation; `Busy` when the engine is held.
    pub fn try_reserve(&self) -> Result<UseGuard<'_, C>> {
        self.reserve_wait(Wait::NoWait)
    }

    /// Timed reservation; `Busy` on expiry.
    pub fn reserve_timeout(&self, timeout: Duration) -> Result<UseGuard<'_, C>> {
        self.reserve_wait(Wait::Timeout(timeout))
    }

    fn reserve_wait(&self, wait: Wait) -> Result<UseGuard<'_, C>> {
        self.core.outer.acquire(wait)?;
        Ok(UseGuard {
            core: &self.core,
            _not_send: PhantomData,
        })
    }

    /// Wait until the machine reaches one of `states`, then reserve it.
    ///
    /// If the state changes between the wait succeeding and the
    /// reservation being acquired, the attempt loops and re-waits rather
    /// than proceeding on stale state. Fails with `Timeout` when the
    /// combined deadline expires before reservation succeeds.
    pub fn when(
        &self,
        states: &[StateRef<C>],
        timeout: Option<Duration>,
    ) -> Result<UseGuard<'_, C>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let remaining = |deadline: Option<Instant>| -> Result<Option<Duration>> {
            match deadline {
                None => Ok(None),
                Some(d) => d
                    .checked_duration_since(Instant::now())
                    .map(Some)
                    .ok_or(StateMachineError::Timeout { operation: "when" }),
            }
        };

        loop {
            if !self.core.wait(states, remaining(deadline)?) {
                return Err(StateMachineError::Timeout { operation: "when" });
            }
            let wait_mode = match remaining(deadline)? {
                None => Wait::Indefinite,
                Some(left) => Wait::Timeout(left),
            };
            let guard = match self.reserve_wait(wait_mode) {
                Ok(guard) => guard,
                Err(StateMachineError::Busy) => {
                    return Err(StateMachineError::Timeout { operation: "when" })
                }
                Err(e) => return Err(e),
            };
            if self.core.in_any(states) {
                return Ok(guard);
            }
            // Raced with another trigger; release and re-wait.
            drop(guard);
        }
    }
}

/// Scoped reservation over the engine's outer lock.
///
/// Not `Send`: the reservation belongs to the acquiring thread.
pub struct UseGuard<'a, C> {
    core: &'a MachineCore<C>,
    _not_send: PhantomData<*const ()>,
}

impl<C> Drop for UseGuard<'_, C> {
    fn drop(&mut self) {
        self.core.outer.release();
    }
}

impl<C: Send + Sync + 'static> MachineCore<C> {
    fn machine(self: &Arc<Self>) -> StateMachine<C> {
        StateMachine { core: self.clone() }
    }

    fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.done.is_set()
    }

    fn is_halted(&self) -> bool {
        !self.run.load(Ordering::Acquire)
    }

    fn current_state(&self) -> Option<StateRef<C>> {
        self.current.read().clone()
    }

    fn in_any(&self, states: &[StateRef<C>]) -> bool {
        match self.current_state() {
            Some(current) => states.iter().any(|s| same_state(s, &current)),
            None => false,
        }
    }

    // ---- lifecycle ----

    fn start(self: &Arc<Self>) -> Result<()> {
        self.outer.acquire(Wait::Indefinite)?;
        let result = self.start_locked();
        self.outer.release();
        result
    }

    fn start_locked(self: &Arc<Self>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(StateMachineError::AlreadyStarted);
        }

        let initial = self.initial.read().clone().ok_or_else(|| {
            StateMachineError::Configuration("initial state is not set".to_string())
        })?;
        {
            let transitions = self.transitions.read();
            if !transitions.is_empty() && !transitions.iter().any(|t| t.mentions(&initial)) {
                return Err(StateMachineError::Configuration(format!(
                    "initial state '{}' is not used by any transition",
                    initial.name()
                )));
            }
        }

        *self.current.write() = Some(initial.clone());
        self.log_graph();

        let machine = self.machine();
        self.hooks.on_start(&machine);

        debug!(state = initial.name(), "calling on_entry() for initial state");
        if let Err(e) = initial.on_entry(&self.context) {
            return Err(StateMachineError::state(HookPhase::OnEntry, e));
        }
        let final_reached = initial.is_final();
        if final_reached {
            self.stop.store(true, Ordering::Release);
        }

        self.run.store(true, Ordering::Release);
        self.started.store(true, Ordering::Release);

        let core = self.clone();
        let handle = thread::Builder::new()
            .name("machina-control".to_string())
            .spawn(move || {
                if final_reached {
                    debug!("initial state is final, control loop skipped");
                } else {
                    core.control_loop();
                    core.hooks.on_exit(&core.machine());
                }
                core.done.set();
            })
            .map_err(|e| {
                StateMachineError::Configuration(format!(
                    "failed to spawn control thread: {e}"
                ))
            })?;
        *self.control.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        debug!("stop state machine");
        if self.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.is_alive() {
            return Err(StateMachineError::NotAlive);
        }
        self.stop.store(true, Ordering::Release);
        self.scheduler.notify_all();
        Ok(())
    }

    fn log_graph(&self) {
        let transitions = self.transitions.read();
        for t in transitions.iter() {
            debug!(
                transition = %t,
                from = ?t.source_names(),
                to = t.target().name(),
                "registered transition"
            );
        }
    }

    // ---- trigger protocol ----

    pub(crate) fn trigger(
        self: &Arc<Self>,
        transition: &Arc<Transition<C>>,
        wait: Wait,
    ) -> Result<()> {
        self.outer.acquire(wait)?;

        // Validation and the outgoing exit hook run under the outer lock.
        let current = match self.validate(transition) {
            Ok(current) => current,
            Err(e) => {
                self.outer.release();
                return Err(e);
            }
        };

        debug!(
            transition = %transition,
            from = current.name(),
            to = transition.target().name(),
            "trigger state transition"
        );

        debug!(state = current.name(), "calling on_exit()");
        if let Err(e) = current.on_exit(&self.context) {
            // Exit errors abort before any state mutation and never run
            // the recovery hook.
            self.outer.release();
            return Err(StateMachineError::state(HookPhase::OnExit, e));
        }

        self.inner.acquire();
        let result = self.apply_target(transition, &current);
        self.inner.release();
        self.scheduler.notify_all();

        if result.is_ok() {
            debug!("state transition completed");
        }
        result
    }

    fn validate(&self, transition: &Transition<C>) -> Result<StateRef<C>> {
        if !self.is_alive() {
            return Err(StateMachineError::NotAlive);
        }
        if self.is_halted() {
            return Err(StateMachineError::Halted);
        }
        let current = self.current_state().ok_or(StateMachineError::NotAlive)?;
        if !transition.can_transition_from(&current) {
            return Err(StateMachineError::InvalidTransition {
                from: current.name().to_string(),
                to: transition.target().name().to_string(),
            });
        }
        Ok(current)
    }

    /// Steps 5-9. Called with both locks held; releases the outer lock
    /// itself, the caller releases the inner lock.
    fn apply_target(
        self: &Arc<Self>,
        transition: &Arc<Transition<C>>,
        from: &StateRef<C>,
    ) -> Result<()> {
        let target = transition.target().clone();

        if let Err(e) = transition.run_callback(&self.context) {
            self.outer.release();
            return Err(self.recover(HookPhase::Callback, e));
        }

        *self.current.write() = Some(target.clone());
        debug!(from = from.name(), to = target.name(), "state changed");

        // The next trigger attempt may begin its own exit from here on.
        self.outer.release();

        if let Err(e) = target.prepare_entry(&self.context) {
            return Err(self.recover(HookPhase::PrepareEntry, e));
        }
        self.state_changed.notify_all();

        let machine = self.machine();
        if let Err(e) = self.hooks.on_state_changed(&machine, from, &target) {
            warn!(error = %e, "on_state_changed() hook failed");
        }

        debug!(state = target.name(), "calling on_entry()");
        match target.on_entry(&self.context) {
            Ok(()) if target.is_final() => {
                debug!("final state reached, closing state machine");
                self.stop.store(true, Ordering::Release);
                Ok(())
            }
            Ok(()) => {
                if let Err(e) = self.hooks.on_state_applied(&machine, &target) {
                    warn!(error = %e, "on_state_applied() hook failed");
                }
                Ok(())
            }
            Err(e) => Err(self.recover(HookPhase::OnEntry, e)),
        }
    }

    /// Halt the machine, run the error handler and surface the original
    /// failure as a state-application error. Recovery keeps the machine
    /// usable; it never hides the failure from the triggering caller.
    fn recover(self: &Arc<Self>, phase: HookPhase, source: anyhow::Error) -> StateMachineError {
        error!(%phase, error = %source, "state application failed, halting state machine");
        self.run.store(false, Ordering::Release);

        let info = ErrorInfo::new(phase, &source);
        let machine = self.machine();
        match self.hooks.handle_error(&machine, &info) {
            Ok(Some(state)) => {
                debug!(state = state.name(), "error handler redirected to recovery state");
                // Forced recovery jump: the state is installed directly,
                // without the exit/entry pipeline.
                *self.current.write() = Some(state);
            }
            Ok(None) => {}
            Err(e) => {
                self.run.store(false, Ordering::Release);
                error!(error = %e, "error handler failed, machine stays halted");
            }
        }
        self.state_changed.notify_all();
        StateMachineError::state(phase, source)
    }

    // ---- control loop ----

    fn control_loop(self: &Arc<Self>) {
        debug!("control loop running");

        while !self.stop.load(Ordering::Acquire) {
            if self.is_halted() {
                self.scheduler.wait(Some(HALTED_POLL));
                continue;
            }

            let Some(transition) = self.next_transition() else {
                debug!("no automatic transition available, waiting");
                self.scheduler.wait(Some(IDLE_POLL));
                continue;
            };

            match self.trigger(&transition, Wait::NoWait) {
                Ok(()) => {}
                Err(StateMachineError::Busy) => {
                    // Another thread holds the machine; retry later.
                    self.scheduler.wait(Some(BUSY_POLL));
                }
                Err(
                    e @ (StateMachineError::Halted
                    | StateMachineError::InvalidTransition { .. }),
                ) => {
                    // Lost a race with a manual trigger or a halt.
                    debug!(error = %e, "skipping automatic transition");
                }
                Err(StateMachineError::NotAlive) => break,
                Err(e) => {
                    warn!(error = %e, "automatic transition failed");
                }
            }
        }

        debug!("exiting control loop");
    }

    /// First applicable automatic transition in registration order.
    fn next_transition(&self) -> Option<Arc<Transition<C>>> {
        let current = self.current_state()?;
        let transitions = self.transitions.read();
        for t in transitions.iter().filter(|t| t.is_automatic()) {
            if !t.can_transition_from(&current) {
                continue;
            }
            match t.is_applicable(&self.context) {
                Ok(true) => return Some(t.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        transition = t.name(),
                        error = %e,
                        "applicability check failed, skipping candidate"
                    );
                }
            }
        }
        None
    }

    // ---- waiting ----

    fn wait(&self, states: &[StateRef<C>], timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.in_any(states) {
                return true;
            }
            let remaining = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) => Some(left),
                    None => return false,
                },
            };
            if !self.state_changed.wait(remaining) {
                // A change landing between the membership check and the
                // notifier capturing its generation would otherwise be
                // reported as a miss.
                return self.in_any(states);
            }
        }
    }
}
