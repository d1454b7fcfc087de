// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! I/O layer errors.

use std::io;

use conjure::ConjureError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("system call failed: {0}")]
    Os(#[from] io::Error),

    #[error("every worker queue is full")]
    QueueFull,

    #[error("path contains an interior NUL byte")]
    InvalidPath,

    #[error("job was dropped before it completed")]
    Lost,

    #[error(transparent)]
    Conjure(#[from] ConjureError),
}

pub type Result<T> = std::result::Result<T, IoError>;
