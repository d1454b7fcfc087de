// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready queue, suspended set, and the scheduler loop.
//!
//! The scheduler is itself a conjury. Whenever a conjury yields, suspends,
//! or ends without a waiter, control lands here. Each pass:
//!
//! 1. drain the ready queue in FIFO order
//! 2. reap detached conjuries that finished since the last pass
//! 3. scan the suspended set for entries that became ready
//!
//! When a scan moves nothing, the scheduler parks the thread briefly and
//! rescans. Predicates may depend on other threads, so starvation is only
//! reported to main once scans have stalled for `STALL_GRACE` with no live
//! `Waker` in sight.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::conjurer::Core;
use crate::conjury::ConjuryId;
use crate::state::State;

/// Stack size of the scheduler conjury. Readiness predicates run on it.
pub const SCHEDULER_STACK_SIZE: usize = 64 * 1024;

/// How long to park when only cross-thread wakes can make progress.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// How long scans must stall before main is told nothing can run.
pub const STALL_GRACE: Duration = Duration::from_millis(250);

/// Readiness predicate of a suspended conjury.
pub(crate) type ReadyPredicate = Box<dyn FnMut() -> bool>;

pub(crate) struct SuspendedEntry {
    pub id: ConjuryId,
    pub ready_pred: Option<ReadyPredicate>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    ready: VecDeque<ConjuryId>,
    suspended: Vec<SuspendedEntry>,
    /// Finished detached conjuries awaiting destruction.
    graveyard: Vec<ConjuryId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ready(&mut self, id: ConjuryId) {
        self.ready.push_back(id);
    }

    pub fn pop_ready(&mut self) -> Option<ConjuryId> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn register_suspended(&mut self, id: ConjuryId, ready_pred: Option<ReadyPredicate>) {
        self.suspended.push(SuspendedEntry { id, ready_pred });
    }

    pub fn suspended_len(&self) -> usize {
        self.suspended.len()
    }

    /// Hand the suspended set to a scan.
    pub fn begin_scan(&mut self) -> Vec<SuspendedEntry> {
        std::mem::take(&mut self.suspended)
    }

    /// Put back the entries that stayed suspended, ahead of anything
    /// registered since `begin_scan`.
    pub fn finish_scan(&mut self, mut kept: Vec<SuspendedEntry>) {
        kept.append(&mut self.suspended);
        self.suspended = kept;
    }

    /// Drop every queued entry for `id`.
    pub fn forget(&mut self, id: ConjuryId) {
        self.ready.retain(|r| *r != id);
        self.suspended.retain(|e| e.id != id);
    }

    pub fn bury(&mut self, id: ConjuryId) {
        self.graveyard.push(id);
    }

    pub fn exhume(&mut self) -> Vec<ConjuryId> {
        std::mem::take(&mut self.graveyard)
    }
}

/// Outcome of one scan of the suspended set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// At least one entry moved to the ready queue.
    Progress,
    /// Nothing moved, but another thread may still wake someone.
    Idle,
    /// Nothing moved and no `Waker` can change that.
    Stalled,
}

/// Body of the scheduler conjury.
pub(crate) fn run(core: &Core) -> ! {
    let mut stalled_since: Option<Instant> = None;
    loop {
        drain_ready(core);
        reap_detached(core);
        match scan_suspended(core) {
            Scan::Progress => stalled_since = None,
            Scan::Idle => {
                stalled_since = None;
                thread::park_timeout(IDLE_PARK);
            }
            Scan::Stalled => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= STALL_GRACE {
                    stalled_since = None;
                    report_deadlock(core);
                } else {
                    thread::park_timeout(IDLE_PARK);
                }
            }
        }
    }
}

fn drain_ready(core: &Core) {
    loop {
        let next = core.scheduler.borrow_mut().pop_ready();
        let Some(id) = next else {
            return;
        };
        let state = core.stage.borrow().state(id);
        match state {
            Some(s) if s.is_executable() => {
                core.switch_unchecked(id, Some(State::Ready));
                reap_detached(core);
            }
            other => trace!(conjury = %id, state = ?other, "skipping stale ready entry"),
        }
    }
}

fn reap_detached(core: &Core) {
    let graves = core.scheduler.borrow_mut().exhume();
    for id in graves {
        let reaped = core.stage.borrow_mut().destroy(id);
        if let Some(conjury) = reaped {
            debug!(conjury = %conjury.name, "reaped detached conjury");
        }
    }
}

fn scan_suspended(core: &Core) -> Scan {
    let entries = core.scheduler.borrow_mut().begin_scan();
    let mut kept = Vec::with_capacity(entries.len());
    let mut moved = 0usize;
    let mut wakeable = false;

    for mut entry in entries {
        let cell = core.stage.borrow().state_cell(entry.id);
        let Some(cell) = cell else {
            trace!(conjury = %entry.id, "dropping suspended entry of reaped conjury");
            continue;
        };
        let woke = cell.take_wake();
        let ready = match cell.load() {
            State::Ready => true,
            State::Suspended => woke || entry.ready_pred.as_mut().map_or(false, |pred| pred()),
            other => {
                trace!(conjury = %entry.id, state = %other, "dropping stale suspended entry");
                continue;
            }
        };
        if ready {
            trace!(conjury = %entry.id, "suspended conjury became ready");
            cell.store(State::Ready);
            core.scheduler.borrow_mut().register_ready(entry.id);
            moved += 1;
        } else {
            wakeable |= cell.can_be_woken();
            kept.push(entry);
        }
    }

    core.scheduler.borrow_mut().finish_scan(kept);

    if moved > 0 {
        Scan::Progress
    } else if wakeable {
        Scan::Idle
    } else {
        Scan::Stalled
    }
}

/// Nothing can run. Pull main out of whatever it was blocked in and let its
/// pending operation fail with `Deadlock`.
fn report_deadlock(core: &Core) {
    let main = core.main_id;
    core.scheduler.borrow_mut().forget(main);
    let suspended = core.scheduler.borrow().suspended_len();
    error!(suspended, "no runnable work; returning control to main");
    core.deadlock.set(Some(suspended));
    core.switch_unchecked(main, Some(State::Ready));
}
