//! stagerun - runs a graph of shell command tasks
//!
//! # Example
//!
//! ```text
//! stagerun -j 4 \
//!     --fetch zlib='git clone https://github.com/madler/zlib' \
//!     --task zlib='cmake --build zlib/build' \
//!     --task app='make -C app' \
//!     --dep app:zlib
//! ```
//!
//! Naming tasks after the options runs only those and what they depend on,
//! `stagerun ... app` here.
//!
//! Ctrl-C interrupts every running command and exits with 130.
//! `STAGERUN_LOG` overrides the log filter.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use stagerun::log::{self, Level, Reason};
use stagerun::{
    CleanFlags, CommandTask, Context, ContextBuilder, FailurePolicy, Phases, TaskManager,
    exit_code, make_names,
};

#[derive(Parser, Debug)]
#[command(name = "stagerun")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log commands without running anything
    #[arg(long)]
    dry_run: bool,

    /// Number of tasks running at the same time (default: hardware threads)
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// Skip the clean phase
    #[arg(long)]
    no_clean_task: bool,

    /// Skip the fetch phase
    #[arg(long)]
    no_fetch_task: bool,

    /// Skip the build and install phase
    #[arg(long)]
    no_build_task: bool,

    /// Clean: delete build output
    #[arg(long)]
    rebuild: bool,

    /// Clean: delete configuration output
    #[arg(long)]
    reconfigure: bool,

    /// Clean: delete the source tree
    #[arg(long)]
    reclone: bool,

    /// Clean: delete downloaded archives
    #[arg(long)]
    redownload: bool,

    /// Clean: delete extracted archives
    #[arg(long)]
    reextract: bool,

    /// Clean: everything
    #[arg(long)]
    new: bool,

    /// Stop starting new tasks after the first failure
    #[arg(long)]
    abort_on_failure: bool,

    /// More logging, twice for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Build command of a task
    #[arg(long = "task", value_name = "NAME=COMMAND", value_parser = parse_assignment)]
    tasks: Vec<(String, String)>,

    /// Fetch command of a task
    #[arg(long = "fetch", value_name = "NAME=COMMAND", value_parser = parse_assignment)]
    fetches: Vec<(String, String)>,

    /// Clean command of a task, run when a clean flag is given
    #[arg(long = "clean", value_name = "NAME=COMMAND", value_parser = parse_assignment)]
    cleans: Vec<(String, String)>,

    /// TASK depends on DEP
    #[arg(long = "dep", value_name = "TASK:DEP", value_parser = parse_dependency)]
    deps: Vec<(String, String)>,

    /// Tasks to run, with their dependencies (default: every task)
    #[arg(value_name = "TASK")]
    selected: Vec<String>,
}

impl Args {
    fn level(&self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::Warning,
            (false, 0) => Level::Info,
            (false, 1) => Level::Debug,
            (false, _) => Level::Trace,
        }
    }

    fn clean_flags(&self) -> CleanFlags {
        if self.new {
            return CleanFlags::all();
        }

        let mut flags = CleanFlags::empty();
        flags.set(CleanFlags::REBUILD, self.rebuild);
        flags.set(CleanFlags::RECONFIGURE, self.reconfigure);
        flags.set(CleanFlags::RECLONE, self.reclone);
        flags.set(CleanFlags::REDOWNLOAD, self.redownload);
        flags.set(CleanFlags::REEXTRACT, self.reextract);
        flags
    }

    fn context(&self) -> Arc<Context> {
        let mut builder = ContextBuilder::new()
            .dry_run(self.dry_run)
            .phases(Phases {
                clean: !self.no_clean_task,
                fetch: !self.no_fetch_task,
                build: !self.no_build_task,
            })
            .clean_flags(self.clean_flags());

        if let Some(jobs) = self.jobs {
            builder = builder.thread_count(jobs);
        }

        if self.abort_on_failure {
            builder = builder.failure_policy(FailurePolicy::AbortRun);
        }

        builder.build()
    }

    fn task_manager(&self) -> stagerun::Result<TaskManager> {
        #[derive(Default)]
        struct Commands<'a> {
            clean: Option<&'a str>,
            fetch: Option<&'a str>,
            build: Option<&'a str>,
            deps: Vec<&'a str>,
        }

        // first mention decides the order
        let mut order: Vec<&str> = Vec::new();
        let mut commands: BTreeMap<&str, Commands<'_>> = BTreeMap::new();

        let mentions = self
            .cleans
            .iter()
            .chain(&self.fetches)
            .chain(&self.tasks)
            .chain(&self.deps);

        for (name, _) in mentions {
            if !commands.contains_key(name.as_str()) {
                order.push(name);
                commands.insert(name, Commands::default());
            }
        }

        for (name, cmd) in &self.cleans {
            if let Some(c) = commands.get_mut(name.as_str()) {
                c.clean = Some(cmd);
            }
        }

        for (name, cmd) in &self.fetches {
            if let Some(c) = commands.get_mut(name.as_str()) {
                c.fetch = Some(cmd);
            }
        }

        for (name, cmd) in &self.tasks {
            if let Some(c) = commands.get_mut(name.as_str()) {
                c.build = Some(cmd);
            }
        }

        for (name, dep) in &self.deps {
            if let Some(c) = commands.get_mut(name.as_str()) {
                c.deps.push(dep);
            }
        }

        let mut tm = TaskManager::new();

        for name in order {
            let Some(c) = commands.remove(name) else {
                continue;
            };

            let mut task = CommandTask::with_names(make_names(vec![name.to_string()]));

            if let Some(cmd) = c.clean {
                task = task.clean_cmd(cmd);
            }

            if let Some(cmd) = c.fetch {
                task = task.fetch_cmd(cmd);
            }

            if let Some(cmd) = c.build {
                task = task.build_cmd(cmd);
            }

            for dep in c.deps {
                task = task.depends_on(dep);
            }

            tm.add(task);
        }

        tm.select(&self.selected)?;

        Ok(tm)
    }
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, cmd)) if !name.is_empty() => Ok((name.to_string(), cmd.to_string())),
        _ => Err(format!("expected NAME=COMMAND, got '{s}'")),
    }
}

fn parse_dependency(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((task, dep)) if !task.is_empty() && !dep.is_empty() => {
            Ok((task.to_string(), dep.to_string()))
        }
        _ => Err(format!("expected TASK:DEP, got '{s}'")),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // the subscriber and the context share the context's output lock
    let cx = args.context();
    log::init(args.level(), cx.output_lock().clone());

    let tm = match args.task_manager() {
        Ok(tm) => Arc::new(tm),
        Err(e) => {
            log::emit(Reason::Generic, Level::Error, &e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let on_ctrl_c = {
        let tm = tm.clone();

        move || {
            log::emit(Reason::Interruption, Level::Info, "caught sigint");
            tm.interrupt_all();
        }
    };

    if let Err(e) = ctrlc::set_handler(on_ctrl_c) {
        log::emit(
            Reason::Generic,
            Level::Warning,
            &format!("ctrl-c won't interrupt tasks: {e}"),
        );
    }

    let result = tm.run_all(&cx);

    match &result {
        Ok(()) => log::emit(Reason::Generic, Level::Info, "done"),
        Err(e) if e.is_interruption() => {}
        Err(e) => log::emit(Reason::Generic, Level::Error, &e.to_string()),
    }

    ExitCode::from(exit_code(&result) as u8)
}
