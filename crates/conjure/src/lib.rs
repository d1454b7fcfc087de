// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Conjure: stackful cooperative coroutines.
//!
//! A `Conjurer` multiplexes many conjuries (coroutines with their own
//! stacks) onto the thread that created it. Control moves only at explicit
//! points: `wait`, `yield_now`, `suspend*`, `resume`, `yield_with`, and the
//! end of a body.
//!
//! Components:
//! - stack/context: guarded stacks and the register-level switch
//! - stage: arena of live conjuries and the active pointer
//! - scheduler: FIFO ready queue and predicate-driven suspended set
//! - conjurer: spawn/wait/yield/suspend/resume and the generator protocol
//! - state: lifecycle states and the cross-thread `Waker`

pub mod config;
mod conjurer;
mod conjury;
mod context;
pub mod error;
mod handle;
mod scheduler;
mod stack;
mod stage;
pub mod state;
mod tunnel;
mod wrapper;

pub use config::Config;
pub use conjurer::Conjurer;
pub use conjury::ConjuryId;
pub use error::{ConjureError, Result};
pub use handle::{GenIter, Generator, Handle};
pub use scheduler::{SCHEDULER_STACK_SIZE, STALL_GRACE};
pub use state::{State, Waker};
