// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking file I/O for conjuries.
//!
//! A conjury that needs a blocking system call hands it to a `WorkerPool`
//! and suspends; the rest of its conjurer keeps running until a worker
//! thread finishes the call and wakes it.
//!
//! Components:
//! - job: the `Job` trait and type-erased `PrimJob`
//! - queue/spinlock: bounded per-worker ring buffers
//! - pool: worker threads, least-loaded submission, `run`
//! - ops: open/read/write/close

pub mod error;
pub mod job;
pub mod ops;
pub mod pool;
pub mod queue;
pub mod spinlock;

pub use error::{IoError, Result};
pub use job::{Job, PrimJob};
pub use ops::{CloseJob, OpenJob, ReadJob, WriteJob, DEFAULT_CREATE_MODE};
pub use pool::WorkerPool;
pub use queue::SyncQueue;
