//! Tasks: the nodes of the dependency graph.
//!
//! A [`Task`] goes through up to three phases per run, in order: clean,
//! fetch, then build and install. Phases never touch the OS directly; they
//! run tools through the [`TaskContext`] they're given, which is how an
//! interruption reaches whatever the task is doing.

mod command;
mod handle;

use std::fmt;

use bitflags::bitflags;

use crate::error::Result;

pub use command::CommandTask;
pub use handle::{TaskContext, TaskHandle};
pub(crate) use handle::run_phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Clean,
    Fetch,
    BuildAndInstall,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 3] = [Phase::Clean, Phase::Fetch, Phase::BuildAndInstall];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Clean => "clean",
            Phase::Fetch => "fetch",
            Phase::BuildAndInstall => "build and install",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// What the clean phase throws away. Flags combine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CleanFlags: u32 {
        /// Delete the source tree, it'll be cloned again.
        const RECLONE = 0x01;
        /// Delete configuration output.
        const RECONFIGURE = 0x02;
        /// Delete build output.
        const REBUILD = 0x04;
        /// Delete downloaded archives.
        const REDOWNLOAD = 0x08;
        /// Delete extracted archives.
        const REEXTRACT = 0x10;
    }
}

/// A named unit of work in the dependency graph.
///
/// Phases default to doing nothing. Every phase must be safe to run again
/// after an interruption.
pub trait Task: Send + Sync {
    /// Stable name first, then aliases. Never empty.
    fn names(&self) -> &[String];

    fn name(&self) -> &str {
        self.names().first().map_or("", String::as_str)
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Names or aliases of the tasks this one depends on.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn clean(&self, _cx: &TaskContext, _flags: CleanFlags) -> Result<()> {
        Ok(())
    }

    fn fetch(&self, _cx: &TaskContext) -> Result<()> {
        Ok(())
    }

    fn build_and_install(&self, _cx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Adds the short name of a dashed task name in front of `names`, so
/// `org-project` can be referred to as `project`.
pub fn make_names(mut names: Vec<String>) -> Vec<String> {
    let Some(main) = names.first() else {
        return names;
    };

    if let Some((_, short)) = main.split_once('-')
        && !short.is_empty()
    {
        names.insert(0, short.to_string());
    }

    names
}
