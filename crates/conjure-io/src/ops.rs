// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! File operations as jobs: open, read, write, close.
//!
//! Each job captures `errno` on the worker thread that made the call.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use conjure::Conjurer;

use crate::error::{IoError, Result};
use crate::job::Job;
use crate::pool::WorkerPool;

/// Permissions for files created without an explicit mode: rw-rw-r--.
pub const DEFAULT_CREATE_MODE: libc::mode_t = 0o664;

fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub struct OpenJob {
    path: CString,
    flags: libc::c_int,
    mode: libc::mode_t,
    result: Option<io::Result<RawFd>>,
}

impl OpenJob {
    /// A zero `mode` together with `O_CREAT` means `DEFAULT_CREATE_MODE`.
    pub fn new(path: &Path, flags: libc::c_int, mode: libc::mode_t) -> Result<Self> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| IoError::InvalidPath)?;
        let mode = if mode == 0 && flags & libc::O_CREAT != 0 {
            DEFAULT_CREATE_MODE
        } else {
            mode
        };
        Ok(Self {
            path,
            flags,
            mode,
            result: None,
        })
    }
}

impl Job for OpenJob {
    type Output = io::Result<RawFd>;

    fn handle(&mut self) {
        let fd = unsafe { libc::open(self.path.as_ptr(), self.flags, self.mode as libc::c_uint) };
        self.result = Some(cvt(fd as isize).map(|fd| fd as RawFd));
    }

    fn into_output(self) -> Self::Output {
        self.result.unwrap_or_else(|| Err(io::ErrorKind::Interrupted.into()))
    }
}

pub struct ReadJob {
    fd: RawFd,
    buf: Vec<u8>,
    result: Option<io::Result<usize>>,
}

impl ReadJob {
    pub fn new(fd: RawFd, len: usize) -> Self {
        Self {
            fd,
            buf: vec![0; len],
            result: None,
        }
    }
}

impl Job for ReadJob {
    type Output = io::Result<Vec<u8>>;

    fn handle(&mut self) {
        let n = unsafe {
            libc::read(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
            )
        };
        self.result = Some(cvt(n));
    }

    fn into_output(self) -> Self::Output {
        let n = self
            .result
            .unwrap_or_else(|| Err(io::ErrorKind::Interrupted.into()))?;
        let mut buf = self.buf;
        buf.truncate(n);
        Ok(buf)
    }
}

pub struct WriteJob {
    fd: RawFd,
    data: Vec<u8>,
    result: Option<io::Result<usize>>,
}

impl WriteJob {
    pub fn new(fd: RawFd, data: Vec<u8>) -> Self {
        Self {
            fd,
            data,
            result: None,
        }
    }
}

impl Job for WriteJob {
    type Output = io::Result<usize>;

    fn handle(&mut self) {
        let n = unsafe {
            libc::write(
                self.fd,
                self.data.as_ptr() as *const libc::c_void,
                self.data.len(),
            )
        };
        self.result = Some(cvt(n));
    }

    fn into_output(self) -> Self::Output {
        self.result
            .unwrap_or_else(|| Err(io::ErrorKind::Interrupted.into()))
    }
}

pub struct CloseJob {
    fd: RawFd,
    result: Option<io::Result<()>>,
}

impl CloseJob {
    pub fn new(fd: RawFd) -> Self {
        Self { fd, result: None }
    }
}

impl Job for CloseJob {
    type Output = io::Result<()>;

    fn handle(&mut self) {
        let ret = unsafe { libc::close(self.fd) };
        self.result = Some(cvt(ret as isize).map(|_| ()));
    }

    fn into_output(self) -> Self::Output {
        self.result
            .unwrap_or_else(|| Err(io::ErrorKind::Interrupted.into()))
    }
}

impl WorkerPool {
    /// `open(2)` on a worker. Returns the new descriptor.
    pub fn open(
        &self,
        conjurer: &Conjurer,
        path: impl AsRef<Path>,
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> Result<RawFd> {
        let job = OpenJob::new(path.as_ref(), flags, mode)?;
        Ok(self.run(conjurer, job)??)
    }

    /// Read up to `len` bytes. A short or empty buffer means end of file.
    pub fn read(&self, conjurer: &Conjurer, fd: RawFd, len: usize) -> Result<Vec<u8>> {
        Ok(self.run(conjurer, ReadJob::new(fd, len))??)
    }

    pub fn write(&self, conjurer: &Conjurer, fd: RawFd, data: impl Into<Vec<u8>>) -> Result<usize> {
        Ok(self.run(conjurer, WriteJob::new(fd, data.into()))??)
    }

    pub fn close(&self, conjurer: &Conjurer, fd: RawFd) -> Result<()> {
        Ok(self.run(conjurer, CloseJob::new(fd))??)
    }
}
