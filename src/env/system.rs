//! This process's own environment.
//!
//! The variables are captured once, on first use, and kept in sync by every
//! [`SystemEnv::set`] afterwards. The capture and the OS writes happen under
//! the same lock, so concurrent workers always see a consistent snapshot.

use std::io;
use std::path::Path;

use parking_lot::Mutex;

use crate::env::block::{Env, PATH, PATH_SEPARATOR, SetMode};
use crate::error::{Error, Result};
use crate::log::{self, Level, Reason};

/// Handle on the current process environment, owned by the run's context.
#[derive(Debug, Default)]
pub struct SystemEnv {
    // None until the first get()
    captured: Mutex<Option<Env>>,
}

impl SystemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this process's environment, capturing it on the
    /// first call.
    pub fn get(&self) -> Env {
        let mut captured = self.captured.lock();

        if let Some(env) = captured.as_ref() {
            return env.clone();
        }

        let mut env = Env::new();

        for (name, value) in std::env::vars_os() {
            let name = name.to_string_lossy();

            // skip the odd entries some shells leave behind, like "=C:"
            if name.is_empty() || name.starts_with('=') {
                continue;
            }

            env.set(&name, &value.to_string_lossy(), SetMode::Replace);
        }

        let copy = env.clone();
        *captured = Some(env);

        copy
    }

    /// Sets a variable on this process and in the captured snapshot.
    ///
    /// A failed OS write is returned as [`Error::EnvWrite`]; callers treat it
    /// as fatal.
    pub fn set(&self, name: &str, value: &str, mode: SetMode) -> Result<()> {
        let mut captured = self.captured.lock();

        let combined = match mode {
            SetMode::Replace => value.to_owned(),
            SetMode::Append => format!("{}{value}", Self::read(name).unwrap_or_default()),
            SetMode::Prepend => format!("{value}{}", Self::read(name).unwrap_or_default()),
        };

        Self::write(name, &combined)?;

        if let Some(env) = captured.as_mut() {
            env.set(name, &combined, SetMode::Replace);
        }

        Ok(())
    }

    /// Reads a variable from the OS, failing if it doesn't exist.
    pub fn get_var(&self, name: &str) -> Result<String> {
        self.get_var_opt(name)
            .ok_or_else(|| Error::EnvMissing(name.to_owned()))
    }

    pub fn get_var_opt(&self, name: &str) -> Option<String> {
        let _captured = self.captured.lock();
        Self::read(name)
    }

    pub fn prepend_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        log::emit(
            Reason::Env,
            Level::Trace,
            &format!("prepending to PATH: {}", path.display()),
        );

        self.change_path(path, SetMode::Prepend)
    }

    pub fn append_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        log::emit(
            Reason::Env,
            Level::Trace,
            &format!("appending to PATH: {}", path.display()),
        );

        self.change_path(path, SetMode::Append)
    }

    fn change_path(&self, path: &Path, mode: SetMode) -> Result<()> {
        let entry = path.to_string_lossy();
        let empty = self.get_var_opt(PATH).is_none_or(|current| current.is_empty());

        let value = match (mode, empty) {
            (_, true) => entry.into_owned(),
            (SetMode::Prepend, false) => format!("{entry}{PATH_SEPARATOR}"),
            _ => format!("{PATH_SEPARATOR}{entry}"),
        };

        let mode = if empty { SetMode::Replace } else { mode };
        self.set(PATH, &value, mode)
    }

    fn read(name: &str) -> Option<String> {
        std::env::var_os(name).map(|value| value.to_string_lossy().into_owned())
    }

    // Goes through std so other threads reading the environment with
    // std::env see the write under the same lock.
    fn write(name: &str, value: &str) -> Result<()> {
        if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
            return Err(Error::EnvWrite {
                name: name.to_owned(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid name or value"),
            });
        }

        // callers hold `captured`, so SystemEnv writers are serialized
        unsafe { std::env::set_var(name, value) };

        Ok(())
    }
}
