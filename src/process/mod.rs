//! Child process execution.
//!
//! - [`Process`]: builder, runner and poll loop for one command
//! - [`args`]: argument rendering rules
//! - [`spawn`]: the OS shim that actually creates children
//! - [`stream`]: what happens to stdout and stderr

pub mod args;
mod core;
pub mod spawn;
pub mod stream;

pub use args::{ArgFlags, ToArg};
pub use core::{Process, ProcessFlags, State};
pub use spawn::{Child, PosixChild, PosixSpawner, Redirect, SpawnRequest, Spawner};
pub use stream::{Encoding, FilterFn, LineFilter, StreamMode};
