// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking work shipped to worker threads.

use std::fmt;

/// A blocking operation run on a worker thread on behalf of a conjury.
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    /// Perform the operation. Runs on a worker thread.
    fn handle(&mut self);

    /// Outcome after `handle`. Read back on the conjurer's thread.
    fn into_output(self) -> Self::Output;
}

/// Type-erased unit of work as stored in a worker queue.
pub struct PrimJob(Box<dyn FnOnce() + Send>);

impl PrimJob {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl fmt::Debug for PrimJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrimJob")
    }
}
