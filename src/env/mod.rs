//! Environment variables for child processes.
//!
//! - [`block`]: the copy-on-write [`Env`] handed to each process
//! - [`system`]: this process's own environment, captured once

pub mod block;
pub mod system;

pub use block::{Env, NativeBlock, PATH, PATH_SEPARATOR, SetMode};
pub use system::SystemEnv;
