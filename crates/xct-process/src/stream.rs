//! Concurrent draining of captured descriptors
//!
//! Every source gets its own task reading through [`AsyncFd`]. Complete lines
//! are sent over one channel to the consumer, which sees them in per-source
//! order. The stream ends once every source hit EOF and was closed.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::error::{ProcessError, Result};
use crate::sys;

const INITIAL_BUFFER_SIZE: usize = 1024;
const BUFFER_INCREMENT: usize = 512;
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Logical descriptor a line came from.
///
/// Captured stdout and stderr are always tagged 1 and 2, whatever parent
/// descriptor actually carried them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputSource(pub RawFd);

impl OutputSource {
    pub const STDOUT: OutputSource = OutputSource(1);
    pub const STDERR: OutputSource = OutputSource(2);

    pub fn fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How captured output is cut into lines
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LineSeparators {
    /// `\n`
    #[default]
    Unix,
    /// `\0`, as printed by `find -print0`
    Zero,
    /// Any of the given bytes
    Custom(Vec<u8>),
    /// Never split; the whole stream is delivered as one chunk
    None,
}

impl LineSeparators {
    fn matches(&self, byte: u8) -> bool {
        match self {
            LineSeparators::Unix => byte == b'\n',
            LineSeparators::Zero => byte == 0,
            LineSeparators::Custom(set) => set.contains(&byte),
            LineSeparators::None => false,
        }
    }
}

/// One line of captured output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    /// Line content without its separator
    pub line: Vec<u8>,
    /// The separator that ended the line; empty for a final unterminated chunk
    pub eol: Vec<u8>,
}

impl OutputLine {
    /// Line including its separator, as UTF-8
    pub fn text(&self) -> Result<String> {
        let mut bytes = Vec::with_capacity(self.line.len() + self.eol.len());
        bytes.extend_from_slice(&self.line);
        bytes.extend_from_slice(&self.eol);
        String::from_utf8(bytes).map_err(|_| ProcessError::InvalidEncoding { fd: self.source })
    }

    /// Line without its separator, as UTF-8
    pub fn line_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.line).map_err(|_| ProcessError::InvalidEncoding { fd: self.source })
    }

    pub fn to_string_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.line).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.eol));
        text
    }
}

/// Decides after each line whether its stream is still worth reading
#[derive(Clone)]
pub struct StreamInterest(Arc<dyn Fn(&OutputLine) -> bool + Send + Sync>);

impl StreamInterest {
    pub fn new<F>(interest: F) -> Self
    where
        F: Fn(&OutputLine) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(interest))
    }

    pub fn keep_reading(&self, line: &OutputLine) -> bool {
        (self.0)(line)
    }
}

impl fmt::Debug for StreamInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamInterest(..)")
    }
}

/// Incremental line reassembly over arbitrary read boundaries
#[derive(Debug, Default)]
pub struct LineSplitter {
    separators: LineSeparators,
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new(separators: LineSeparators) -> Self {
        Self {
            separators,
            pending: Vec::new(),
        }
    }

    /// Feed bytes, returning every `(line, eol)` they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &byte) in data.iter().enumerate() {
            if self.separators.matches(byte) {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(&data[start..i]);
                lines.push((line, vec![byte]));
                start = i + 1;
            }
        }
        self.pending.extend_from_slice(&data[start..]);
        lines
    }

    /// Flush the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.pending.is_empty() {
            None
        } else {
            Some((std::mem::take(&mut self.pending), Vec::new()))
        }
    }
}

/// A readable descriptor and the tag its lines carry
#[derive(Debug)]
pub struct StreamSource {
    pub fd: OwnedFd,
    pub tag: OutputSource,
}

/// Collects sources, then drains them all concurrently
#[derive(Debug, Default)]
pub struct StreamMultiplexer {
    separators: LineSeparators,
    sources: Vec<StreamSource>,
    interest: Option<StreamInterest>,
}

impl StreamMultiplexer {
    pub fn new(separators: LineSeparators) -> Self {
        Self {
            separators,
            sources: Vec::new(),
            interest: None,
        }
    }

    /// Close a source as soon as `interest` rejects one of its lines.
    pub fn set_interest(&mut self, interest: StreamInterest) {
        self.interest = Some(interest);
    }

    pub fn add_source(&mut self, fd: OwnedFd, tag: OutputSource) {
        self.sources.push(StreamSource { fd, tag });
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Start one reader task per source.
    ///
    /// Must be called from within a tokio runtime. Sources that cannot be
    /// registered with the reactor fail the whole start; the ones already
    /// started are torn down with the returned error.
    pub fn start(self) -> Result<OutputStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut readers = Vec::with_capacity(self.sources.len());

        for source in self.sources {
            let tag = source.tag;
            sys::set_nonblocking(source.fd.as_raw_fd())?;
            // SAFETY: the `File` owns the descriptor and stays inside the
            // `AsyncFd` until the reader task drops it.
            let fd = unsafe { AsyncFd::register_with_interest(File::from(source.fd), Interest::READABLE) }
                .map_err(|e| ProcessError::StreamRead {
                    fd: tag,
                    error: e.into_parts().1,
                })?;
            debug!(fd = %tag, raw_fd = fd.get_ref().as_raw_fd(), "Draining output source");
            let reader = tasks.spawn(drain_source(
                fd,
                tag,
                self.separators.clone(),
                self.interest.clone(),
                tx.clone(),
            ));
            readers.push((tag, reader));
        }

        Ok(OutputStream { rx, tasks, readers })
    }
}

async fn drain_source(
    fd: AsyncFd<File>,
    tag: OutputSource,
    separators: LineSeparators,
    interest: Option<StreamInterest>,
    tx: mpsc::UnboundedSender<Result<OutputLine>>,
) {
    let mut splitter = LineSplitter::new(separators);
    let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
    let mut flush_tail = true;

    let outcome = loop {
        let n = match read_some(&fd, &mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(error) => break Err(error),
        };
        trace!(fd = %tag, bytes = n, "Read output");

        let mut stop = false;
        for (line, eol) in splitter.push(&buf[..n]) {
            let line = OutputLine { source: tag, line, eol };
            let keep = interest.as_ref().map_or(true, |i| i.keep_reading(&line));
            if tx.send(Ok(line)).is_err() {
                stop = true;
                break;
            }
            if !keep {
                debug!(fd = %tag, "Output source no longer of interest");
                flush_tail = false;
                stop = true;
                break;
            }
        }
        if stop {
            break Ok(());
        }

        if n == buf.len() && buf.len() < MAX_BUFFER_SIZE {
            buf.resize(buf.len() + BUFFER_INCREMENT, 0);
        }
    };

    if let Some((line, eol)) = splitter.finish().filter(|_| flush_tail) {
        let _ = tx.send(Ok(OutputLine { source: tag, line, eol }));
    }

    if let Err(error) = outcome {
        warn!(fd = %tag, error = %error, "Failed to read output");
        let _ = tx.send(Err(ProcessError::StreamRead { fd: tag, error }));
    }

    drop(fd);
    debug!(fd = %tag, "Output source closed");
    // `tx` is released last, so the stream only completes after the close.
    drop(tx);
}

async fn read_some(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(buf)
        }) {
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Lines from every source, in arrival order
///
/// `next()` returning `None` is the completion signal. Dropping the stream
/// aborts the readers and closes their descriptors.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<Result<OutputLine>>,
    tasks: JoinSet<()>,
    readers: Vec<(OutputSource, AbortHandle)>,
}

impl OutputStream {
    /// Next line or read error; `None` once every source is drained.
    pub async fn next(&mut self) -> Option<Result<OutputLine>> {
        let event = self.rx.recv().await;
        if event.is_none() {
            while self.tasks.join_next().await.is_some() {}
        }
        event
    }

    /// Stop reading `source` and close its descriptor.
    ///
    /// Lines already read are still delivered. Returns false if no source
    /// carries that tag.
    pub fn close_source(&mut self, source: OutputSource) -> bool {
        let mut found = false;
        for (tag, reader) in &self.readers {
            if *tag == source {
                reader.abort();
                found = true;
            }
        }
        if found {
            debug!(fd = %source, "Closing output source early");
        }
        found
    }

    /// Drain everything, stopping at the first read error.
    pub async fn collect(mut self) -> Result<Vec<OutputLine>> {
        let mut lines = Vec::new();
        while let Some(event) = self.next().await {
            lines.push(event?);
        }
        Ok(lines)
    }
}
