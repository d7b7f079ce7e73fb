//! Copy-on-write environment block.
//!
//! An [`Env`] shares its backing [`Block`] with every clone until one of them
//! is mutated; the mutator then deep-copies the variables into a block it owns
//! exclusively. The OS-native form handed to process creation is derived
//! lazily and dropped on every mutation.

use std::ffi::CString;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Name of the executable search path variable.
pub const PATH: &str = "PATH";

/// Delimiter between entries of [`PATH`].
#[cfg(windows)]
pub const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const PATH_SEPARATOR: &str = ":";

/// How [`Env::set`] combines a new value with an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Replace,
    Append,
    Prepend,
}

/// Serialized `NAME=value` entries, ready for `posix_spawn`.
#[derive(Debug, Default)]
pub struct NativeBlock {
    entries: Vec<CString>,
}

impl NativeBlock {
    /// Null-terminated pointer array over the entries. Only valid while
    /// `self` is alive.
    pub fn envp(&self) -> Vec<*mut c_char> {
        self.entries
            .iter()
            .map(|entry| entry.as_ptr() as *mut c_char)
            .chain(std::iter::once(ptr::null_mut()))
            .collect()
    }

    /// Flat form: every entry followed by a nul, plus a final nul.
    pub fn to_flat(&self) -> Vec<u8> {
        let mut flat = Vec::new();

        for entry in &self.entries {
            flat.extend_from_slice(entry.as_bytes_with_nul());
        }

        flat.push(0);
        flat
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Vars(Vec<(String, String)>);

impl Vars {
    fn find(&self, name: &str) -> Option<&String> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    fn set(&mut self, name: &str, value: &str, mode: SetMode) {
        let current = self
            .0
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value);

        let Some(current) = current else {
            self.0.push((name.to_owned(), value.to_owned()));
            return;
        };

        match mode {
            SetMode::Replace => *current = value.to_owned(),
            SetMode::Append => current.push_str(value),
            SetMode::Prepend => current.insert_str(0, value),
        }
    }
}

#[derive(Debug, Default)]
struct BlockData {
    vars: Vars,
    // None when stale
    native: Option<Arc<NativeBlock>>,
}

#[derive(Debug, Default)]
struct Block {
    data: Mutex<BlockData>,
}

impl Block {
    fn with_vars(vars: Vars) -> Self {
        Self {
            data: Mutex::new(BlockData { vars, native: None }),
        }
    }
}

/// A set of environment variables with case-insensitive names.
///
/// Cloning is cheap: both instances share one block and lose ownership of
/// it, so the first write on either side copies.
#[derive(Debug, Default)]
pub struct Env {
    block: Option<Arc<Block>>,
    owned: AtomicBool,
}

impl Clone for Env {
    fn clone(&self) -> Self {
        self.owned.store(false, Ordering::Release);

        Self {
            block: self.block.clone(),
            owned: AtomicBool::new(false),
        }
    }
}

impl Env {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut env = Self::new();

        for (name, value) in vars {
            env.set(name.as_ref(), value.as_ref(), SetMode::Replace);
        }

        env
    }

    /// Sets `name`, combining with the current value according to `mode`.
    /// A missing variable is treated as empty.
    pub fn set(&mut self, name: &str, value: &str, mode: SetMode) -> &mut Self {
        let block = self.block_for_write();
        let mut data = block.data.lock();

        data.vars.set(name, value, mode);
        data.native = None;
        drop(data);

        self
    }

    /// Consuming variant of [`Env::set`] with [`SetMode::Replace`].
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.set(name, value, SetMode::Replace);
        self
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let block = self.block.as_ref()?;
        let data = block.data.lock();

        data.vars.find(name).cloned()
    }

    /// Snapshot of every variable, in insertion order.
    pub fn vars(&self) -> Vec<(String, String)> {
        match &self.block {
            Some(block) => block.data.lock().vars.0.clone(),
            None => Vec::new(),
        }
    }

    pub fn append_path(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.change_path([path], SetMode::Append)
    }

    pub fn prepend_path(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.change_path([path], SetMode::Prepend)
    }

    pub fn append_paths<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.change_path(paths, SetMode::Append)
    }

    /// Prepends each path in turn, so the last one ends up first.
    pub fn prepend_paths<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.change_path(paths, SetMode::Prepend)
    }

    /// Replaces PATH with the given entries.
    pub fn set_path<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.change_path(paths, SetMode::Replace)
    }

    fn change_path<I, P>(&mut self, paths: I, mode: SetMode) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut path = match mode {
            SetMode::Replace => String::new(),
            SetMode::Append | SetMode::Prepend => self.get(PATH).unwrap_or_default(),
        };

        for entry in paths {
            let entry = entry.as_ref().to_string_lossy();

            match mode {
                SetMode::Replace | SetMode::Append => {
                    if !path.is_empty() {
                        path.push_str(PATH_SEPARATOR);
                    }
                    path.push_str(&entry);
                }
                SetMode::Prepend => {
                    if !path.is_empty() {
                        path.insert_str(0, PATH_SEPARATOR);
                    }
                    path.insert_str(0, &entry);
                }
            }
        }

        self.set(PATH, &path, SetMode::Replace)
    }

    /// Returns the cached native form, building it if a mutation invalidated
    /// it.
    pub fn native_block(&self) -> Result<Arc<NativeBlock>> {
        let Some(block) = &self.block else {
            return Ok(Arc::new(NativeBlock::default()));
        };

        let mut data = block.data.lock();

        if let Some(native) = &data.native {
            return Ok(native.clone());
        }

        let entries = data
            .vars
            .0
            .iter()
            .map(|(name, value)| {
                CString::new(format!("{name}={value}"))
                    .map_err(|_| Error::EnvEncoding { name: name.clone() })
            })
            .collect::<Result<Vec<_>>>()?;

        let native = Arc::new(NativeBlock { entries });
        data.native = Some(native.clone());

        Ok(native)
    }

    fn block_for_write(&mut self) -> &Block {
        let owned = *self.owned.get_mut();

        let block = match self.block.take() {
            Some(block) if owned => block,
            shared => {
                let vars = shared
                    .map(|block| block.data.lock().vars.clone())
                    .unwrap_or_default();

                *self.owned.get_mut() = true;
                Arc::new(Block::with_vars(vars))
            }
        };

        self.block.insert(block)
    }

    #[cfg(test)]
    fn shares_block_with(&self, other: &Env) -> bool {
        match (&self.block, &other.block) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_until_write() {
        let mut original = Env::new();
        original.set("A", "1", SetMode::Replace);

        let mut copy = original.clone();
        assert!(copy.shares_block_with(&original));

        copy.set("A", "2", SetMode::Replace);
        assert!(!copy.shares_block_with(&original));
    }

    #[test]
    fn test_owner_copies_after_being_cloned() {
        let mut original = Env::new();
        original.set("A", "1", SetMode::Replace);

        let copy = original.clone();
        original.set("B", "2", SetMode::Replace);

        assert!(!copy.shares_block_with(&original));
        assert_eq!(copy.get("B"), None);
    }

    #[test]
    fn test_native_cache_is_reused_until_mutation() {
        let mut env = Env::from_vars([("A", "1")]);

        let first = env.native_block().unwrap();
        let second = env.native_block().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        env.set("B", "2", SetMode::Replace);
        let third = env.native_block().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_envp_is_null_terminated() {
        let env = Env::from_vars([("A", "1"), ("B", "2")]);
        let native = env.native_block().unwrap();
        let envp = native.envp();

        assert_eq!(envp.len(), 3);
        assert!(envp[2].is_null());
        assert_eq!(native.to_flat(), b"A=1\0B=2\0\0");
    }

    #[test]
    fn test_nul_in_value_is_rejected() {
        let env = Env::from_vars([("BAD", "a\0b")]);

        assert!(matches!(
            env.native_block(),
            Err(Error::EnvEncoding { name }) if name == "BAD"
        ));
    }
}
