use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};
use crate::pipe::fd::{create_pipe, set_nonblocking, would_block};

/// Maximum number of bytes returned by one read.
const BUFFER_SIZE: usize = 50 * 1024;

/// Read side of a pipe connected to a child's stdout or stderr.
///
/// Reads never block. The pipe only reports [`closed`](Self::closed) once a
/// read with `finish` set came back empty, or the OS reported a broken pipe;
/// from then on every read is a no-op.
pub struct StdoutPipe {
    pipe: Option<OwnedFd>,
    buffer: Box<[u8]>,
    closed: bool,
    // the write end is gone, no point in polling
    eof: bool,
}

impl Default for StdoutPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutPipe {
    pub fn new() -> Self {
        Self {
            pipe: None,
            buffer: vec![0; BUFFER_SIZE].into_boxed_slice(),
            closed: true,
            eof: false,
        }
    }

    /// Allocates the OS pipe and returns the end to give to the child.
    pub fn create(&mut self) -> Result<OwnedFd> {
        let (read, write) = create_pipe()?;
        set_nonblocking(read.as_raw_fd())?;

        self.pipe = Some(read);
        self.closed = false;
        self.eof = false;

        Ok(write)
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Returns whatever bytes are available right now, possibly none.
    ///
    /// When `finish` is true and nothing was available, the pipe becomes
    /// closed and its descriptor is released.
    pub fn read(&mut self, finish: bool) -> Result<&[u8]> {
        if self.closed {
            return Ok(&[]);
        }

        let n = self.try_read()?;

        if finish && n == 0 {
            self.closed = true;
        }

        if self.closed {
            self.pipe = None;
        }

        Ok(&self.buffer[..n])
    }

    /// Gives up on the pipe, whatever is left unread.
    pub fn close(&mut self) {
        self.closed = true;
        self.pipe = None;
    }

    /// Descriptor worth polling for readability, if any.
    pub(crate) fn pollable_fd(&self) -> Option<RawFd> {
        if self.closed || self.eof {
            return None;
        }

        self.pipe.as_ref().map(|pipe| pipe.as_raw_fd())
    }

    fn try_read(&mut self) -> Result<usize> {
        let Some(file_descriptor) = self.pipe.as_ref().map(|pipe| pipe.as_raw_fd()) else {
            return Ok(0);
        };

        let res = unsafe {
            libc::read(
                file_descriptor,
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
            )
        };

        if res > 0 {
            return Ok(res as usize);
        }

        if res == 0 {
            self.eof = true;
            return Ok(0);
        }

        let err = io::Error::last_os_error();

        if would_block(&err) {
            return Ok(0);
        }

        if err.raw_os_error() == Some(libc::EPIPE) {
            // the other end is gone for good
            self.closed = true;
            return Ok(0);
        }

        Err(Error::os("failed to read from pipe", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pipe_is_closed_until_created() {
        let mut pipe = StdoutPipe::new();
        assert!(pipe.closed());
        assert!(pipe.read(true).unwrap().is_empty());

        let _write = pipe.create().unwrap();
        assert!(!pipe.closed());
    }

    #[test]
    fn test_eof_stops_polling_but_not_reading() {
        let mut pipe = StdoutPipe::new();
        let write = pipe.create().unwrap();
        drop(write);

        assert!(pipe.read(false).unwrap().is_empty());
        assert!(pipe.pollable_fd().is_none());
        assert!(!pipe.closed());

        assert!(pipe.read(true).unwrap().is_empty());
        assert!(pipe.closed());
    }
}
