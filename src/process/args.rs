//! Command line arguments and how they're rendered.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::log::{self, Level};

bitflags! {
    /// How an argument is added to the command line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArgFlags: u32 {
        /// Wrap in double quotes. Paths are always quoted.
        const QUOTE = 0x01;
        /// No space between key and value.
        const NOSPACE = 0x02;
        /// Paths use `/` as separator.
        const FORWARD_SLASHES = 0x04;
        /// Only added when debug logging is enabled.
        const LOG_DEBUG = 0x08;
        /// Only added when trace logging is enabled.
        const LOG_TRACE = 0x10;
        /// Only added when dump logging is enabled.
        const LOG_DUMP = 0x20;
        /// Dropped when trace logging is enabled.
        const LOG_QUIET = 0x40;
    }
}

/// Something that can be rendered as one command line argument.
pub trait ToArg {
    fn to_arg(&self, flags: ArgFlags) -> String;
}

fn quote_if(s: String, flags: ArgFlags) -> String {
    if flags.contains(ArgFlags::QUOTE) {
        format!("\"{s}\"")
    } else {
        s
    }
}

impl ToArg for str {
    fn to_arg(&self, flags: ArgFlags) -> String {
        quote_if(self.to_string(), flags)
    }
}

impl ToArg for String {
    fn to_arg(&self, flags: ArgFlags) -> String {
        self.as_str().to_arg(flags)
    }
}

impl ToArg for Path {
    fn to_arg(&self, flags: ArgFlags) -> String {
        let mut s = self.to_string_lossy().into_owned();

        if flags.contains(ArgFlags::FORWARD_SLASHES) {
            s = s.replace('\\', "/");
        }

        format!("\"{s}\"")
    }
}

impl ToArg for PathBuf {
    fn to_arg(&self, flags: ArgFlags) -> String {
        self.as_path().to_arg(flags)
    }
}

macro_rules! impl_to_arg_for_integers {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self, _flags: ArgFlags) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_to_arg_for_integers!(i32, i64, u32, u64, usize);

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self, flags: ArgFlags) -> String {
        (**self).to_arg(flags)
    }
}

/// Whether an argument with `flags` is wanted at the current log level.
fn wanted(flags: ArgFlags) -> bool {
    if flags.contains(ArgFlags::LOG_DEBUG) && !log::enabled(Level::Debug) {
        return false;
    }

    if flags.contains(ArgFlags::LOG_TRACE) && !log::enabled(Level::Trace) {
        return false;
    }

    if flags.contains(ArgFlags::LOG_DUMP) && !log::enabled(Level::Dump) {
        return false;
    }

    if flags.contains(ArgFlags::LOG_QUIET) && log::enabled(Level::Trace) {
        return false;
    }

    true
}

/// Appends ` key value` (or ` keyvalue`) to `cmd`.
///
/// Nothing is added if both are empty or the flags ask for a log level
/// that isn't enabled.
pub(crate) fn push_arg(cmd: &mut String, key: &str, value: &str, flags: ArgFlags) {
    if !wanted(flags) {
        return;
    }

    if key.is_empty() && value.is_empty() {
        return;
    }

    cmd.push(' ');

    if key.is_empty() {
        cmd.push_str(value);
    } else if flags.contains(ArgFlags::NOSPACE) || key.ends_with('=') {
        cmd.push_str(key);
        cmd.push_str(value);
    } else {
        cmd.push_str(key);
        cmd.push(' ');
        cmd.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(key: &str, value: &str, flags: ArgFlags) -> String {
        let mut cmd = String::new();
        push_arg(&mut cmd, key, value, flags);
        cmd
    }

    #[test]
    fn test_key_value_spacing() {
        assert_eq!(render("-j", "4", ArgFlags::empty()), " -j 4");
        assert_eq!(render("--prefix=", "/usr", ArgFlags::empty()), " --prefix=/usr");
        assert_eq!(render("-I", "inc", ArgFlags::NOSPACE), " -Iinc");
        assert_eq!(render("", "", ArgFlags::empty()), "");
        assert_eq!(render("", "install", ArgFlags::empty()), " install");
    }

    #[test]
    fn test_paths_are_always_quoted() {
        assert_eq!(Path::new("a b").to_arg(ArgFlags::empty()), "\"a b\"");
        assert_eq!(
            Path::new(r"C:\dev").to_arg(ArgFlags::FORWARD_SLASHES),
            "\"C:/dev\""
        );
        assert_eq!("x".to_arg(ArgFlags::empty()), "x");
        assert_eq!("x".to_arg(ArgFlags::QUOTE), "\"x\"");
        assert_eq!(42_i32.to_arg(ArgFlags::QUOTE), "42");
    }
}
