//! OS boundary for child process creation.
//!
//! [`Spawner`] is the only place a child process comes from. The default
//! [`PosixSpawner`] runs every command through `/bin/sh -c` in a new process
//! group, so signals sent to the group reach everything the command started.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;

use libc::{c_char, c_int, pid_t};

use crate::env::NativeBlock;
use crate::error::{Error, Result};

const SHELL: &std::ffi::CStr = c"/bin/sh";
const DEV_NULL: &std::ffi::CStr = c"/dev/null";

/// Where one of the child's standard descriptors goes.
#[derive(Debug)]
pub enum Redirect {
    /// Same descriptor as this process.
    Inherit,
    /// `/dev/null`.
    Null,
    /// The child end of a pipe; closed in this process after the spawn.
    Fd(OwnedFd),
}

/// Everything needed to start one child.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub command: &'a str,
    pub cwd: Option<&'a Path>,
    pub env: &'a NativeBlock,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

/// Creates child processes.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Box<dyn Child>>;
}

/// A running child process.
pub trait Child: Send {
    /// OS process id, `0` if the child can't be targeted individually.
    fn id(&self) -> u32;

    /// Returns the exit code if the child has exited, without blocking.
    /// A child killed by a signal reports `128 + signal`.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Asks the child's process tree to stop.
    fn interrupt(&mut self) -> Result<()>;

    /// Kills the child's process tree.
    fn terminate(&mut self) -> Result<()>;
}

/// Spawns children with `posix_spawn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixSpawner;

impl Spawner for PosixSpawner {
    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Box<dyn Child>> {
        let script = match request.cwd {
            Some(cwd) => format!("cd {} && {}", shell_quote(cwd), request.command),
            None => request.command.to_string(),
        };

        let script = CString::new(script).map_err(|e| {
            Error::os(
                "command contains a nul byte",
                io::Error::new(io::ErrorKind::InvalidInput, e),
            )
        })?;

        let argv: [*mut c_char; 4] = [
            SHELL.as_ptr() as *mut c_char,
            c"-c".as_ptr() as *mut c_char,
            script.as_ptr() as *mut c_char,
            ptr::null_mut(),
        ];

        let envp = request.env.envp();

        let mut actions = FileActions::new()?;
        actions.redirect(&request.stdin, 0, libc::O_RDONLY)?;
        actions.redirect(&request.stdout, 1, libc::O_WRONLY)?;
        actions.redirect(&request.stderr, 2, libc::O_WRONLY)?;

        let attributes = SpawnAttributes::new()?;

        let mut pid: pid_t = 0;

        let res = unsafe {
            libc::posix_spawn(
                &mut pid,
                SHELL.as_ptr(),
                actions.as_ptr(),
                attributes.as_ptr(),
                argv.as_ptr(),
                envp.as_ptr(),
            )
        };

        if res != 0 {
            return Err(Error::os(
                "failed to start process",
                io::Error::from_raw_os_error(res),
            ));
        }

        // the child ends of the pipes are dropped with `request`
        Ok(Box::new(PosixChild { pid, status: None }))
    }
}

/// Single-quotes `path` for the shell.
fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    format!("'{}'", s.replace('\'', r"'\''"))
}

struct FileActions(MaybeUninit<libc::posix_spawn_file_actions_t>);

impl FileActions {
    fn new() -> Result<Self> {
        let mut actions = MaybeUninit::uninit();

        let res = unsafe { libc::posix_spawn_file_actions_init(actions.as_mut_ptr()) };
        if res != 0 {
            return Err(Error::os(
                "posix_spawn_file_actions_init failed",
                io::Error::from_raw_os_error(res),
            ));
        }

        Ok(Self(actions))
    }

    fn redirect(&mut self, redirect: &Redirect, target: RawFd, oflag: c_int) -> Result<()> {
        let res = match redirect {
            Redirect::Inherit => 0,
            Redirect::Null => unsafe {
                libc::posix_spawn_file_actions_addopen(
                    self.0.as_mut_ptr(),
                    target,
                    DEV_NULL.as_ptr(),
                    oflag,
                    0,
                )
            },
            Redirect::Fd(fd) => unsafe {
                libc::posix_spawn_file_actions_adddup2(self.0.as_mut_ptr(), fd.as_raw_fd(), target)
            },
        };

        if res != 0 {
            return Err(Error::os(
                format!("failed to redirect descriptor {target}"),
                io::Error::from_raw_os_error(res),
            ));
        }

        Ok(())
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        self.0.as_ptr()
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(self.0.as_mut_ptr());
        }
    }
}

struct SpawnAttributes(MaybeUninit<libc::posix_spawnattr_t>);

impl SpawnAttributes {
    /// New process group, default signal handlers and an empty signal mask,
    /// whatever this process has installed.
    fn new() -> Result<Self> {
        let mut attributes = MaybeUninit::uninit();

        let res = unsafe { libc::posix_spawnattr_init(attributes.as_mut_ptr()) };
        if res != 0 {
            return Err(Error::os(
                "posix_spawnattr_init failed",
                io::Error::from_raw_os_error(res),
            ));
        }

        let mut this = Self(attributes);

        let flags = libc::POSIX_SPAWN_SETPGROUP
            | libc::POSIX_SPAWN_SETSIGDEF
            | libc::POSIX_SPAWN_SETSIGMASK;

        let res = unsafe {
            let attr = this.0.as_mut_ptr();

            let mut all = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigfillset(all.as_mut_ptr());

            let mut none = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(none.as_mut_ptr());

            let mut res = libc::posix_spawnattr_setflags(attr, flags as libc::c_short);

            if res == 0 {
                res = libc::posix_spawnattr_setpgroup(attr, 0);
            }

            if res == 0 {
                res = libc::posix_spawnattr_setsigdefault(attr, all.as_ptr());
            }

            if res == 0 {
                res = libc::posix_spawnattr_setsigmask(attr, none.as_ptr());
            }

            res
        };

        if res != 0 {
            return Err(Error::os(
                "failed to set spawn attributes",
                io::Error::from_raw_os_error(res),
            ));
        }

        Ok(this)
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        self.0.as_ptr()
    }
}

impl Drop for SpawnAttributes {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(self.0.as_mut_ptr());
        }
    }
}

/// A child started by [`PosixSpawner`], leader of its own process group.
#[derive(Debug)]
pub struct PosixChild {
    pid: pid_t,
    status: Option<i32>,
}

impl PosixChild {
    fn signal_group(&self, signal: c_int) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }

        if unsafe { libc::killpg(self.pid, signal) } == -1 {
            let err = io::Error::last_os_error();

            // already gone
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }

            return Err(Error::os(format!("failed to signal process {}", self.pid), err));
        }

        Ok(())
    }

    fn wait(&mut self, options: c_int) -> Result<Option<i32>> {
        if let Some(code) = self.status {
            return Ok(Some(code));
        }

        let mut status: c_int = 0;

        loop {
            let res = unsafe { libc::waitpid(self.pid, &mut status, options) };

            if res == 0 {
                return Ok(None);
            }

            if res == -1 {
                let err = io::Error::last_os_error();

                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }

                return Err(Error::os(format!("failed to wait for process {}", self.pid), err));
            }

            let code = decode_status(status);
            self.status = Some(code);

            return Ok(Some(code));
        }
    }
}

fn decode_status(status: c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

impl Child for PosixChild {
    fn id(&self) -> u32 {
        self.pid as u32
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        self.wait(libc::WNOHANG)
    }

    fn interrupt(&mut self) -> Result<()> {
        self.signal_group(libc::SIGINT)
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal_group(libc::SIGKILL)
    }
}

impl Drop for PosixChild {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.signal_group(libc::SIGKILL);
            let _ = self.wait(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Path::new("/tmp/a b")), "'/tmp/a b'");
        assert_eq!(shell_quote(Path::new("it's")), r"'it'\''s'");
    }

    #[test]
    fn test_exit_status_of_spawned_shell() {
        let env = NativeBlock::default();

        let mut child = PosixSpawner
            .spawn(SpawnRequest {
                command: "exit 3",
                cwd: None,
                env: &env,
                stdin: Redirect::Null,
                stdout: Redirect::Null,
                stderr: Redirect::Null,
            })
            .unwrap();

        let code = loop {
            if let Some(code) = child.try_wait().unwrap() {
                break code;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert_eq!(code, 3);
    }
}
