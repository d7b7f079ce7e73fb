use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use libc::{F_GETFL, F_SETFL, O_NONBLOCK, fcntl};

use crate::error::{Error, Result};

/// Creates an anonymous pipe, returning `(read, write)`.
///
/// Both ends are close-on-exec so children spawned concurrently by other
/// workers never inherit them; the end given to a child is duplicated onto
/// its standard descriptor, which clears the flag.
pub(crate) fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    if raw_pipe(&mut fds) == -1 {
        return Err(Error::last_os("failed to create pipe"));
    }

    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&read))?;
        set_cloexec(std::os::fd::AsRawFd::as_raw_fd(&write))?;
    }

    Ok((read, write))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn raw_pipe(fds: &mut [RawFd; 2]) -> libc::c_int {
    unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_pipe(fds: &mut [RawFd; 2]) -> libc::c_int {
    unsafe { libc::pipe(fds.as_mut_ptr()) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(file_descriptor: RawFd) -> Result<()> {
    let flags = unsafe { fcntl(file_descriptor, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os("fcntl(F_GETFD) failed"));
    }

    if unsafe { fcntl(file_descriptor, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::last_os("fcntl(F_SETFD) failed"));
    }

    Ok(())
}

pub(crate) fn set_nonblocking(file_descriptor: RawFd) -> Result<()> {
    let flags = unsafe { fcntl(file_descriptor, F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os("fcntl(F_GETFL) failed"));
    }

    if unsafe { fcntl(file_descriptor, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(Error::last_os("fcntl(F_SETFL) failed"));
    }

    Ok(())
}

/// Whether the OS error is a "try again later" condition.
pub(crate) fn would_block(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINTR,
        None => false,
    }
}

/// Waits until one of `fds` is readable or `timeout_ms` elapses.
///
/// With no descriptors this is a plain sleep. Interruption by a signal is
/// treated as a timeout.
pub(crate) fn poll_readable(fds: &[RawFd], timeout_ms: i32) -> Result<()> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let result = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::os("failed to wait on process", err));
        }
    }

    Ok(())
}
