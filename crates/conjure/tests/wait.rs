// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Wait, resume, and end-of-body hand-off between conjuries.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use conjure::{Config, ConjureError, Conjurer, Handle, State};

fn mult_two(x: i32) -> i32 {
    x * 2
}

#[test]
fn wait_returns_body_value() {
    let c = Conjurer::new();
    let h = c.conjure(Config::named("mult-two"), |_| mult_two(2));
    assert_eq!(c.state(h), Some(State::Initial));
    assert_eq!(c.wait(h), Ok(4));

    // Reaped: the handle is stale now.
    assert_eq!(c.state(h), None);
    assert_eq!(c.wait(h), Err(ConjureError::UnknownConjury(h.id())));
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn body_does_not_run_until_waited() {
    let c = Conjurer::new();
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let h = c.conjure(Config::default(), move |_| r.set(true));
    assert!(!ran.get());
    c.wait(h).unwrap();
    assert!(ran.get());
}

#[test]
fn nested_waits_unwind_in_order() {
    let c = Conjurer::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let outer = c.conjure(Config::named("outer"), move |c| {
        l.borrow_mut().push("outer start");
        let inner_log = l.clone();
        let inner = c.conjure(Config::named("inner"), move |_| {
            inner_log.borrow_mut().push("inner");
            10
        });
        let v = c.wait(inner).unwrap();
        l.borrow_mut().push("outer end");
        v + 1
    });
    assert_eq!(c.wait(outer), Ok(11));
    assert_eq!(*log.borrow(), ["outer start", "inner", "outer end"]);
}

#[test]
fn second_waiter_is_rejected() {
    let c = Conjurer::new();
    let gate = Rc::new(Cell::new(false));
    let g = gate.clone();
    let target: Handle<u32> = c.conjure(Config::named("target"), move |c| {
        c.suspend_until(|| g.get()).unwrap();
        7
    });
    let first = c.conjure(Config::named("first"), move |c| c.wait(target));
    let second = c.conjure(Config::named("second"), move |c| c.wait(target));

    assert!(c.resume(first));
    match c.wait(second).unwrap() {
        Err(ConjureError::InconsistentWait {
            waiter,
            target,
            holder,
        }) => {
            assert_eq!(waiter, "second");
            assert_eq!(target, "target");
            assert_eq!(holder, "first");
        }
        other => panic!("expected InconsistentWait, got {:?}", other),
    }

    gate.set(true);
    assert_eq!(c.wait(first).unwrap(), Ok(7));
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn resume_after_finish_is_refused() {
    let c = Conjurer::new();
    let runs = Rc::new(Cell::new(0));
    let r = runs.clone();
    let h = c.conjure(Config::named("once"), move |_| r.set(r.get() + 1));

    assert!(c.resume(h));
    assert!(c.is_finished(h));
    assert!(!c.resume(h));
    assert_eq!(runs.get(), 1);

    c.wait(h).unwrap();
    assert_eq!(runs.get(), 1);
}

#[test]
fn yield_goes_back_to_resumer() {
    let c = Conjurer::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let h = c.conjure(Config::named("stepper"), move |c| {
        l.borrow_mut().push(1);
        c.yield_now();
        l.borrow_mut().push(3);
    });

    assert!(c.resume(h));
    log.borrow_mut().push(2);
    assert_eq!(c.state(h), Some(State::Ready));
    c.wait(h).unwrap();
    assert_eq!(*log.borrow(), [1, 2, 3]);
}

#[test]
fn resume_suspended_is_refused() {
    let c = Conjurer::new();
    let h = c.conjure(Config::named("sleeper"), |c| {
        c.suspend().unwrap();
        5
    });
    assert!(c.resume(h));
    assert_eq!(c.state(h), Some(State::Suspended));
    assert!(!c.resume(h));

    assert!(c.wake(h));
    assert_eq!(c.wait(h), Ok(5));
}

#[test]
fn panic_is_reported_to_waiter() {
    let c = Conjurer::new();
    let h: Handle<u32> = c.conjure(Config::named("doomed").stack_size(256 * 1024), |_| {
        panic!("boom")
    });
    match c.wait(h) {
        Err(ConjureError::Panicked { conjury, message }) => {
            assert_eq!(conjury, "doomed");
            assert_eq!(message, "boom");
        }
        other => panic!("expected Panicked, got {:?}", other),
    }
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn active_name_follows_control() {
    let c = Conjurer::new();
    assert_eq!(c.active_name(), "__main__");
    let h = c.conjure(Config::named("inner"), |c| c.active_name());
    assert_eq!(c.wait(h).as_deref(), Ok("inner"));
    assert_eq!(c.active_name(), "__main__");
}

#[test]
fn results_of_any_type() {
    let c = Conjurer::new();
    let h = c.conjure(Config::default(), |_| vec![String::from("a"), String::from("b")]);
    assert_eq!(c.wait(h).unwrap(), ["a", "b"]);
    let h = c.conjure(Config::default(), |_| ());
    assert_eq!(c.wait(h), Ok(()));
}
