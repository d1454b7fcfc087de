// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Conjury lifecycle states and the cross-thread wake path.
//!
//! The state lives in an atomic cell so that I/O worker threads can move a
//! suspended conjury to `Ready` without touching anything else. Every other
//! transition happens on the conjurer's own thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;

/// Conjury lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, body not entered yet.
    Initial = 0,
    /// Runnable; waiting for the scheduler or a direct switch.
    Ready = 1,
    /// Currently executing. Exactly one conjury per conjurer is running.
    Running = 2,
    /// Parked in the scheduler's suspended set.
    Suspended = 3,
    /// Blocked until another conjury finishes or yields a value.
    Waiting = 4,
    /// Body returned. Terminal.
    Finished = 5,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initial,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Waiting,
            _ => Self::Finished,
        }
    }

    /// Only these states may be the target of a control transfer.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::Ready | Self::Initial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Waiting => "Waiting",
            Self::Finished => "Finished",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state word of one conjury.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: AtomicU8,
    /// Set by a wake that found the conjury not (yet) suspended.
    wake_pending: AtomicBool,
    /// Live `Waker`s pointing at this cell.
    wakers: AtomicUsize,
}

impl StateCell {
    pub fn new(state: State) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(state as u8),
            wake_pending: AtomicBool::new(false),
            wakers: AtomicUsize::new(0),
        })
    }

    pub fn load(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn store(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Suspended -> Ready`. Returns false if the conjury was in any other
    /// state; the wake is then remembered for its next plain suspension.
    pub fn wake(&self) -> bool {
        self.wake_pending.store(true, Ordering::Release);
        self.state
            .compare_exchange(
                State::Suspended as u8,
                State::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Consume a remembered wake.
    pub fn take_wake(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }

    /// Whether something outside the scheduler may still wake this conjury.
    pub fn can_be_woken(&self) -> bool {
        self.wakers.load(Ordering::Acquire) > 0 || self.wake_pending.load(Ordering::Acquire)
    }
}

/// Thread-safe handle that makes a suspended conjury runnable again.
///
/// Obtained from `Conjurer::waker` for the active conjury. Hand it to an
/// OS thread, then `suspend()`; the scheduler picks the conjury up on its
/// next pass after `wake` is called.
#[derive(Debug)]
pub struct Waker {
    cell: Arc<StateCell>,
    thread: Thread,
}

impl Waker {
    pub(crate) fn new(cell: Arc<StateCell>, thread: Thread) -> Self {
        cell.wakers.fetch_add(1, Ordering::AcqRel);
        Self { cell, thread }
    }

    /// Mark the conjury ready and nudge the conjurer's thread if it is idle.
    pub fn wake(self) {
        self.cell.wake();
        self.thread.unpark();
    }
}

impl Clone for Waker {
    fn clone(&self) -> Self {
        Self::new(self.cell.clone(), self.thread.clone())
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        self.cell.wakers.fetch_sub(1, Ordering::AcqRel);
    }
}
