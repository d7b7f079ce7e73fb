//! Pipes between this process and its children.
//!
//! - [`StdoutPipe`]: non-blocking reads from a child's stdout or stderr
//! - [`StdinPipe`]: non-blocking writes to a child's stdin

pub(crate) mod fd;
mod stdin;
mod stdout;

pub use stdin::StdinPipe;
pub use stdout::StdoutPipe;
