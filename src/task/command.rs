use std::path::PathBuf;

use crate::error::Result;
use crate::log::Level;
use crate::process::Process;
use crate::task::{CleanFlags, Task, TaskContext};

/// A task whose phases are shell commands.
///
/// # Example
/// ```ignore
/// let zlib = CommandTask::new("zlib")
///     .fetch_cmd("git clone https://github.com/madler/zlib")
///     .build_cmd("cmake --build build")
///     .depends_on("cmake");
/// ```
#[derive(Debug, Clone)]
pub struct CommandTask {
    names: Vec<String>,
    dependencies: Vec<String>,
    enabled: bool,
    cwd: Option<PathBuf>,
    output_level: Level,
    clean: Option<String>,
    fetch: Option<String>,
    build: Option<String>,
}

impl CommandTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_names(vec![name.into()])
    }

    /// Uses `names` as is, the first one being the stable name.
    pub fn with_names(names: Vec<String>) -> Self {
        Self {
            names,
            dependencies: Vec::new(),
            enabled: true,
            cwd: None,
            output_level: Level::Info,
            clean: None,
            fetch: None,
            build: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.names.push(alias.into());
        self
    }

    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.dependencies.push(task.into());
        self
    }

    /// Keeps the task out of runs unless another task depends on it.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Directory every command runs in.
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Level of the commands' stdout lines, info by default.
    pub fn output_level(mut self, level: Level) -> Self {
        self.output_level = level;
        self
    }

    pub fn clean_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.clean = Some(cmd.into());
        self
    }

    pub fn fetch_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.fetch = Some(cmd.into());
        self
    }

    pub fn build_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.build = Some(cmd.into());
        self
    }

    fn run(&self, cx: &TaskContext, cmd: Option<&String>) -> Result<()> {
        let Some(cmd) = cmd else {
            return Ok(());
        };

        let mut process = Process::new(cx.context())
            .raw(cmd.as_str())
            .name(format!("{} {}", self.name(), cx.phase()))
            .stdout_level(self.output_level);

        if let Some(cwd) = &self.cwd {
            process = process.cwd(cwd);
        }

        cx.run_process(process)?;

        Ok(())
    }
}

impl Task for CommandTask {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    // the command decides what each flag means
    fn clean(&self, cx: &TaskContext, _flags: CleanFlags) -> Result<()> {
        self.run(cx, self.clean.as_ref())
    }

    fn fetch(&self, cx: &TaskContext) -> Result<()> {
        self.run(cx, self.fetch.as_ref())
    }

    fn build_and_install(&self, cx: &TaskContext) -> Result<()> {
        self.run(cx, self.build.as_ref())
    }
}
