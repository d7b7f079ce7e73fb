use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::{Error, Result};
use crate::pipe::fd::{create_pipe, set_nonblocking, would_block};

/// Write side of a pipe connected to a child's stdin.
///
/// The write end is non-blocking: each write sends what the pipe accepts
/// right now and doesn't keep a copy of the data.
#[derive(Default)]
pub struct StdinPipe {
    pipe: Option<OwnedFd>,
}

impl StdinPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the OS pipe and returns the end to give to the child.
    pub fn create(&mut self) -> Result<OwnedFd> {
        let (read, write) = create_pipe()?;
        set_nonblocking(write.as_raw_fd())?;
        self.pipe = Some(write);

        Ok(read)
    }

    /// Sends as much of `bytes` as the pipe accepts, returning how many were
    /// written.
    ///
    /// A full pipe writes 0 bytes and stays open. If the child already closed
    /// its stdin, the pipe is closed and nothing is written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let Some(file_descriptor) = self.pipe.as_ref().map(|pipe| pipe.as_raw_fd()) else {
            return Ok(0);
        };

        let written = unsafe {
            libc::write(
                file_descriptor,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };

        if written < 0 {
            let err = io::Error::last_os_error();

            if would_block(&err) {
                return Ok(0);
            }

            if err.raw_os_error() == Some(libc::EPIPE) {
                self.close();
                return Ok(0);
            }

            return Err(Error::os("failed to write to stdin pipe", err));
        }

        if written == 0 && !bytes.is_empty() {
            return Err(Error::os(
                "failed to write to stdin pipe",
                io::Error::from(io::ErrorKind::WriteZero),
            ));
        }

        Ok(written as usize)
    }

    /// Releases the write end, the child sees end-of-file.
    pub fn close(&mut self) {
        self.pipe = None;
    }

    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }
}
