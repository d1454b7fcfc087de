// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Ready-queue order, suspension predicates, wakes, detach, and the
//! starvation diagnostic.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conjure::{Config, ConjureError, Conjurer, Handle, State, STALL_GRACE};

type Log = Rc<RefCell<Vec<String>>>;

fn two_step(c: &Conjurer, name: &str, log: &Log, done: Option<Rc<Cell<usize>>>) -> Handle<()> {
    let log = log.clone();
    let name = name.to_string();
    c.conjure(Config::named(name.clone()), move |c| {
        log.borrow_mut().push(format!("{}1", name));
        c.yield_now();
        log.borrow_mut().push(format!("{}2", name));
        if let Some(done) = done {
            done.set(done.get() + 1);
        }
    })
}

#[test]
fn resumed_conjuries_drain_in_spawn_order() {
    let c = Conjurer::new();
    let log = Log::default();
    let handles: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|n| two_step(&c, n, &log, None))
        .collect();

    for h in &handles {
        assert!(c.resume(*h));
    }
    for h in handles {
        c.wait(h).unwrap();
    }
    assert_eq!(*log.borrow(), ["A1", "B1", "C1", "A2", "B2", "C2"]);
}

#[test]
fn finishing_conjury_does_not_jump_the_queue() {
    let c = Conjurer::new();
    let log = Log::default();
    let handles: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|n| two_step(&c, n, &log, None))
        .collect();

    for h in &handles {
        assert!(c.resume(*h));
    }
    c.yield_now();
    log.borrow_mut().push("main".to_string());
    assert_eq!(*log.borrow(), ["A1", "B1", "C1", "A2", "B2", "C2", "main"]);

    for h in handles {
        assert!(c.is_finished(h));
        c.wait(h).unwrap();
    }
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn scheduler_runs_detached_conjuries_fifo() {
    let c = Conjurer::new();
    let log = Log::default();
    let done = Rc::new(Cell::new(0));
    for n in ["A", "B", "C"] {
        let h = two_step(&c, n, &log, Some(done.clone()));
        c.detach(h);
    }
    assert_eq!(c.live_conjuries(), 3);

    c.suspend_until(|| done.get() == 3).unwrap();
    assert_eq!(*log.borrow(), ["A1", "B1", "C1", "A2", "B2", "C2"]);
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn suspend_until_true_does_not_switch() {
    let c = Conjurer::new();
    let h = c.conjure(Config::default(), |c| {
        c.suspend_until(|| true).unwrap();
        c.active_name()
    });
    assert!(c.resume(h));
    assert!(c.is_finished(h));
    c.wait(h).unwrap();
}

#[test]
fn producer_consumer_terminate() {
    let c = Conjurer::new();
    let queue: Rc<RefCell<VecDeque<u32>>> = Rc::default();
    let finished = Rc::new(Cell::new(false));
    let consumed = Rc::new(RefCell::new(Vec::new()));

    let producer = {
        let queue = queue.clone();
        let finished = finished.clone();
        c.conjure(Config::named("producer"), move |c| {
            for i in 0..5 {
                c.suspend_until(|| queue.borrow().is_empty()).unwrap();
                queue.borrow_mut().push_back(i);
            }
            finished.set(true);
        })
    };
    let consumer = {
        let queue = queue.clone();
        let finished = finished.clone();
        let consumed = consumed.clone();
        c.conjure(Config::named("consumer"), move |c| loop {
            c.suspend_until(|| !queue.borrow().is_empty() || finished.get())
                .unwrap();
            let next = queue.borrow_mut().pop_front();
            match next {
                Some(v) => consumed.borrow_mut().push(v),
                None => break,
            }
        })
    };

    assert!(c.resume(consumer));
    c.wait(producer).unwrap();
    c.wait(consumer).unwrap();
    assert_eq!(*consumed.borrow(), [0, 1, 2, 3, 4]);
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn predicate_may_query_conjurer() {
    let c = Rc::new(Conjurer::new());
    let worker = c.conjure(Config::named("worker"), |c| {
        c.yield_now();
        c.yield_now();
    });
    c.detach(worker);
    let watcher = {
        let inner = c.clone();
        c.conjure(Config::named("watcher"), move |c| {
            c.suspend_until(|| inner.state(worker).is_none()).unwrap();
            "saw worker reaped"
        })
    };
    assert_eq!(c.wait(watcher), Ok("saw worker reaped"));
}

#[test]
fn starvation_is_reported_to_main() {
    let c = Conjurer::new();
    let h: Handle<()> = c.conjure(Config::named("stuck"), |c| {
        let _ = c.suspend_until(|| false);
    });
    assert_eq!(c.wait(h), Err(ConjureError::Deadlock { suspended: 1 }));
    assert_eq!(c.state(h), Some(State::Suspended));
}

#[test]
fn predicate_over_flag_set_by_another_thread() {
    let c = Conjurer::new();
    let flag = Arc::new(AtomicBool::new(false));
    let setter = {
        let flag = flag.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Release);
        })
    };
    let h = c.conjure(Config::named("flag-watcher"), move |c| {
        c.suspend_until(|| flag.load(Ordering::Acquire)).unwrap();
        "flag seen"
    });
    assert_eq!(c.wait(h), Ok("flag seen"));
    setter.join().unwrap();
}

#[test]
fn starvation_is_reported_after_grace_period() {
    let c = Conjurer::new();
    let started = Instant::now();
    assert_eq!(c.suspend(), Err(ConjureError::Deadlock { suspended: 0 }));
    assert!(started.elapsed() >= STALL_GRACE);
}

#[test]
fn plain_suspend_on_main_without_waker_deadlocks() {
    let c = Conjurer::new();
    assert_eq!(c.suspend(), Err(ConjureError::Deadlock { suspended: 0 }));
    // Still usable afterwards.
    let h = c.conjure(Config::default(), |_| 1);
    assert_eq!(c.wait(h), Ok(1));
}

#[test]
fn waker_from_another_thread() {
    let c = Conjurer::new();
    let h = c.conjure(Config::named("sleeper").stack_size(64 * 1024), |c| {
        let waker = c.waker();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        c.suspend().unwrap();
        t.join().unwrap();
        "woken"
    });
    assert_eq!(c.wait(h), Ok("woken"));
}

#[test]
fn wake_before_suspend_is_not_lost() {
    let c = Conjurer::new();
    let h = c.conjure(Config::named("early").stack_size(64 * 1024), |c| {
        let waker = c.waker();
        thread::spawn(move || waker.wake()).join().unwrap();
        c.suspend().unwrap();
        3
    });
    assert_eq!(c.wait(h), Ok(3));
}

#[test]
fn detach_after_finish_reaps_immediately() {
    let c = Conjurer::new();
    let h = c.conjure(Config::default(), |_| ());
    assert!(c.resume(h));
    assert_eq!(c.live_conjuries(), 1);
    c.detach(h);
    assert_eq!(c.live_conjuries(), 0);
}

#[test]
fn main_yield_runs_ready_conjuries() {
    let c = Conjurer::new();
    let hits = Rc::new(Cell::new(0));
    let hh = hits.clone();
    let h = c.conjure(Config::default(), move |c| {
        hh.set(hh.get() + 1);
        c.yield_now();
        hh.set(hh.get() + 1);
    });
    c.detach(h);
    c.yield_now();
    assert_eq!(hits.get(), 1);
    c.yield_now();
    assert_eq!(hits.get(), 2);
    c.yield_now();
    assert_eq!(c.live_conjuries(), 0);
}
