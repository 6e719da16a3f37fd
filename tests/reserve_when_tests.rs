//! Scoped reservation (`reserve`) and wait-then-reserve (`when`) tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use machina::{
    BasicState, State, StateMachine, StateMachineError, StateRef, TransitionHandle,
    TransitionOptions,
};

/// State whose entry takes a while, leaving a window in which other
/// threads can observe or reserve the machine mid-transition.
struct SlowEntry {
    name: &'static str,
    delay: Duration,
}

impl State<()> for SlowEntry {
    fn name(&self) -> &str {
        self.name
    }

    fn on_entry(&self, _context: &()) -> anyhow::Result<()> {
        thread::sleep(self.delay);
        Ok(())
    }
}

/// A → B → C manual chain plus an automatic C → D tail.
#[allow(clippy::type_complexity)]
fn chain_machine() -> (
    StateMachine<()>,
    Vec<StateRef<()>>,
    TransitionHandle<()>,
    TransitionHandle<()>,
) {
    let sm = StateMachine::new(());
    let a = BasicState::shared("A");
    let b = BasicState::shared("B");
    let c = BasicState::shared("C");
    let d = BasicState::shared("D");

    let a_to_b = sm.connect(&[a.clone()], b.clone()).unwrap();
    let b_to_c = sm.connect(&[b.clone()], c.clone()).unwrap();
    sm.connect_with(&[c.clone()], d.clone(), TransitionOptions::automatic())
        .unwrap();
    sm.set_initial_state(a.clone());

    (sm, vec![a, b, c, d], a_to_b, b_to_c)
}

#[test]
fn test_basic_transition() {
    let (sm, states, a_to_b, _b_to_c) = chain_machine();
    sm.start().unwrap();

    a_to_b.trigger().unwrap();
    assert!(sm.is_in(&states[1]));

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_reserve_makes_trigger_sequence_atomic() {
    let (sm, states, a_to_b, b_to_c) = chain_machine();
    sm.start().unwrap();

    {
        let _guard = sm.reserve().unwrap();
        a_to_b.trigger().unwrap();
        b_to_c.trigger().unwrap();
        // The automatic C → D tail cannot fire while we hold the machine.
        assert!(sm.is_in(&states[2]));
    }

    assert!(sm.wait(&[states[3].clone()], Some(Duration::from_secs(2))));

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_reserve_from_worker_thread() {
    let (sm, states, a_to_b, _b_to_c) = chain_machine();
    sm.start().unwrap();

    let worker = sm.clone();
    let b = states[1].clone();
    let reached_b = thread::spawn(move || {
        let _guard = worker.reserve().unwrap();
        a_to_b.trigger().unwrap();
        worker.is_in(&b)
    })
    .join()
    .unwrap();
    assert!(reached_b);

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_when_observes_target_state() {
    let (sm, states, a_to_b, b_to_c) = chain_machine();
    sm.start().unwrap();

    a_to_b.trigger().unwrap();
    b_to_c.trigger().unwrap();

    let observer = sm.clone();
    let d = states[3].clone();
    let observed = thread::spawn(move || {
        let guard = observer.when(&[d.clone()], Some(Duration::from_secs(2)))?;
        let inside = observer.is_in(&d);
        drop(guard);
        Ok::<bool, StateMachineError>(inside)
    })
    .join()
    .unwrap()
    .unwrap();
    assert!(observed);

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_when_blocks_scheduler_inside_guard() {
    let sm = StateMachine::new(());
    let a = BasicState::shared("A");
    let b: StateRef<()> = Arc::new(SlowEntry {
        name: "B",
        delay: Duration::from_millis(100),
    });
    let c = BasicState::shared("C");

    let a_to_b = sm.connect(&[a.clone()], b.clone()).unwrap();
    sm.connect_with(&[b.clone()], c.clone(), TransitionOptions::automatic())
        .unwrap();
    sm.set_initial_state(a.clone());
    sm.start().unwrap();

    let observer = sm.clone();
    let target = b.clone();
    let observed_in_b = Arc::new(AtomicBool::new(false));
    let seen = observed_in_b.clone();
    let waiter = thread::spawn(move || {
        let guard = observer
            .when(&[target.clone()], Some(Duration::from_secs(5)))
            .unwrap();
        // While reserved, the automatic B → C transition must not fire.
        seen.store(observer.is_in(&target), Ordering::Release);
        thread::sleep(Duration::from_millis(150));
        assert!(observer.is_in(&target));
        drop(guard);
    });

    // Give the waiter time to block, then move to B with a slow entry so
    // the reservation wins the race against the scheduler.
    thread::sleep(Duration::from_millis(50));
    a_to_b.trigger().unwrap();

    waiter.join().unwrap();
    assert!(observed_in_b.load(Ordering::Acquire));

    // Reservation released; the automatic tail proceeds.
    assert!(sm.wait(&[c.clone()], Some(Duration::from_secs(2))));
    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_when_times_out_when_state_never_reached() {
    let (sm, states, _a_to_b, _b_to_c) = chain_machine();
    sm.start().unwrap();

    let result = sm.when(&[states[3].clone()], Some(Duration::from_millis(100)));
    assert!(matches!(result, Err(StateMachineError::Timeout { .. })));

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_when_returns_immediately_when_already_there() {
    let (sm, states, _a_to_b, _b_to_c) = chain_machine();
    sm.start().unwrap();

    let guard = sm
        .when(&[states[0].clone()], Some(Duration::from_millis(100)))
        .unwrap();
    assert!(sm.is_in(&states[0]));
    drop(guard);

    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_try_reserve_contention() {
    let (sm, _states, _a_to_b, _b_to_c) = chain_machine();
    sm.start().unwrap();

    let guard = sm.reserve().unwrap();

    let contender = sm.clone();
    let result = thread::spawn(move || {
        let busy = matches!(contender.try_reserve(), Err(StateMachineError::Busy));
        let timed_out = matches!(
            contender.reserve_timeout(Duration::from_millis(50)),
            Err(StateMachineError::Busy)
        );
        busy && timed_out
    })
    .join()
    .unwrap();
    assert!(result);

    drop(guard);
    sm.stop().unwrap();
    assert!(sm.join(Some(Duration::from_secs(1))).unwrap());
}
