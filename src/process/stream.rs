//! Output stream policy and line splitting for captured child output.

use std::fmt;
use std::sync::Arc;

use crate::log::{Level, Reason};
use crate::pipe::StdoutPipe;

/// What happens to a child's stdout or stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Split into lines, filtered, logged at the stream's level.
    #[default]
    ForwardToLog,
    /// Kept as text, retrievable after the process finishes.
    KeepInString,
    /// Discarded.
    BitBucket,
    /// Shared with this process.
    Inherit,
}

/// How captured bytes are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8, invalid sequences replaced.
    #[default]
    Utf8,
    /// UTF-16, little endian.
    Utf16,
}

/// One output line on its way to the log. Filters may change the level or
/// drop the line.
#[derive(Debug, Clone)]
pub struct LineFilter {
    pub line: String,
    pub reason: Reason,
    pub level: Level,
    pub discard: bool,
}

pub type FilterFn = Arc<dyn Fn(&mut LineFilter) + Send + Sync>;

pub(crate) struct Stream {
    pub(crate) mode: StreamMode,
    pub(crate) level: Level,
    pub(crate) reason: Reason,
    pub(crate) filter: Option<FilterFn>,
    pub(crate) pipe: StdoutPipe,
    pub(crate) buffer: EncodedBuffer,
}

impl Stream {
    pub(crate) fn new(reason: Reason, level: Level) -> Self {
        Self {
            mode: StreamMode::default(),
            level,
            reason,
            filter: None,
            pipe: StdoutPipe::new(),
            buffer: EncodedBuffer::new(Encoding::default()),
        }
    }

    /// Whether output goes through a pipe.
    pub(crate) fn piped(&self) -> bool {
        matches!(self.mode, StreamMode::ForwardToLog | StreamMode::KeepInString)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("mode", &self.mode)
            .field("level", &self.level)
            .field("reason", &self.reason)
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Every byte read from a pipe, with the position up to which lines were
/// already handed out.
#[derive(Debug)]
pub(crate) struct EncodedBuffer {
    encoding: Encoding,
    bytes: Vec<u8>,
    consumed: usize,
}

impl EncodedBuffer {
    pub(crate) fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            bytes: Vec::new(),
            consumed: 0,
        }
    }

    pub(crate) fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub(crate) fn add(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Calls `f` for every complete, non-empty line not handed out yet.
    ///
    /// The trailing partial line is kept for later unless `finish` is set.
    pub(crate) fn next_lines(&mut self, finish: bool, mut f: impl FnMut(String)) {
        while let Some(line) = self.next_line(finish) {
            f(line);
        }
    }

    /// Everything ever added, decoded.
    pub(crate) fn text(&self) -> String {
        self.decode(&self.bytes)
    }

    fn next_line(&mut self, finish: bool) -> Option<String> {
        loop {
            let rest = &self.bytes[self.consumed..];

            if rest.is_empty() {
                return None;
            }

            let line = match self.find_newline(rest) {
                Some((end, width)) => {
                    let line = self.decode(&rest[..end]);
                    self.consumed += end + width;
                    line
                }

                None if finish => {
                    let line = self.decode(rest);
                    self.consumed = self.bytes.len();
                    line
                }

                None => return None,
            };

            let line = line.strip_suffix('\r').unwrap_or(&line);

            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    // (offset of the newline, width of the newline)
    fn find_newline(&self, bytes: &[u8]) -> Option<(usize, usize)> {
        match self.encoding {
            Encoding::Utf8 => bytes.iter().position(|&b| b == b'\n').map(|i| (i, 1)),
            Encoding::Utf16 => bytes
                .chunks_exact(2)
                .position(|unit| unit == [b'\n', 0])
                .map(|i| (i * 2, 2)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Utf16 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
                    .collect();

                String::from_utf16_lossy(&units)
            }
        }
    }
}
