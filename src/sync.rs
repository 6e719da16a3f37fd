//! # Chained Lock Primitives
//!
//! The trigger protocol releases its outer lock in the middle of the entry
//! phase, which RAII mutex guards cannot express, so the locks here expose
//! explicit acquire/release. The outer lock is additionally reentrant per
//! thread (depth counted) so that triggers issued inside a reservation
//! block keep working.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Result, StateMachineError};

/// How long a lock acquisition is willing to wait for the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Indefinite,
    NoWait,
    Timeout(Duration),
}

#[derive(Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Reentrant, timed, explicitly released mutual exclusion.
///
/// Held from the start of a trigger attempt through validation and the
/// outgoing `on_exit`, and released once the new state pointer is set so
/// the next trigger may begin while the entry phase is still running.
pub(crate) struct OuterLock {
    owner: Mutex<Owner>,
    freed: Condvar,
}

impl OuterLock {
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(Owner::default()),
            freed: Condvar::new(),
        }
    }

    /// Acquire per `wait` mode. Contention under `NoWait` or an expired
    /// `Timeout` fails with [`StateMachineError::Busy`] and no side effects.
    pub fn acquire(&self, wait: Wait) -> Result<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();

        if owner.thread == Some(me) {
            owner.depth += 1;
            return Ok(());
        }

        match wait {
            Wait::NoWait => {
                if owner.thread.is_some() {
                    return Err(StateMachineError::Busy);
                }
            }
            Wait::Indefinite => {
                while owner.thread.is_some() {
                    self.freed.wait(&mut owner);
                }
            }
            Wait::Timeout(timeout) => {
                let deadline = Instant::now() + timeout;
                while owner.thread.is_some() {
                    if self.freed.wait_until(&mut owner, deadline).timed_out()
                        && owner.thread.is_some()
                    {
                        return Err(StateMachineError::Busy);
                    }
                }
            }
        }

        owner.thread = Some(me);
        owner.depth = 1;
        Ok(())
    }

    /// Release one level of ownership. Must be called by the owning thread.
    pub fn release(&self) {
        let mut owner = self.owner.lock();
        debug_assert_eq!(owner.thread, Some(thread::current().id()));
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            self.freed.notify_one();
        }
    }
}

/// Non-reentrant explicitly released lock serializing entry/exit pairs.
///
/// Acquired before the outer lock is released and held through the whole
/// entry phase. Acquisition always blocks; timeouts apply to the outer
/// lock only.
pub(crate) struct InnerLock {
    held: Mutex<bool>,
    freed: Condvar,
}

impl InnerLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.freed.wait(&mut held);
        }
        *held = true;
    }

    pub fn release(&self) {
        let mut held = self.held.lock();
        debug_assert!(*held);
        *held = false;
        self.freed.notify_one();
    }
}

/// Condition-variable broadcast with a generation counter.
///
/// Notifications are delivered at least once to every thread already
/// waiting; waiters must re-check their predicate after waking since no
/// wakeup is guaranteed to correspond to a specific change.
pub(crate) struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify_all(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait for the next notification. Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut generation = self.generation.lock();
        let seen = *generation;
        match timeout {
            None => {
                while *generation == seen {
                    self.cond.wait(&mut generation);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *generation == seen {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != seen;
                    }
                }
                true
            }
        }
    }
}

/// One-way settable flag with timed waits. Backs `join()`.
pub(crate) struct Flag {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Flag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Wait until set. Returns false if `timeout` expired first.
    pub fn wait_set(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !*state {
                    self.cond.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*state {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return *state;
                    }
                }
                true
            }
        }
    }
}
