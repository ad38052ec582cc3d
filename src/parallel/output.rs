//! Output handles for parallel tasks
//!
//! Every worker writes through a [`TaskOutput`]. Buffered workers collect
//! output privately until the coordinator decides when it reaches the sink;
//! the live worker writes straight to the sink unless it has been muted.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Destination stream that task output is eventually flushed to
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    /// Wrap any writer
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Process stdout
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write a chunk as one unit. A chunk that does not end in a newline gets
    /// one so that the next chunk starts on a fresh line.
    pub(crate) fn write_chunk(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut writer = lock(&self.inner);
        let written = writer.write_all(chunk).and_then(|()| {
            if chunk.ends_with(b"\n") {
                Ok(())
            } else {
                writer.write_all(b"\n")
            }
        });
        if let Err(e) = written.and_then(|()| writer.flush()) {
            warn!("Unable to write {} bytes of task output: {}", chunk.len(), e);
        }
    }

    pub(crate) fn write_raw(&self, bytes: &[u8]) {
        let mut writer = lock(&self.inner);
        if let Err(e) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            warn!("Unable to write {} bytes of live output: {}", bytes.len(), e);
        }
    }
}

/// In-memory writer whose contents can be read back, usable as a sink
#[derive(Clone, Default)]
pub struct CapturedOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }

    /// A sink writing into this capture
    pub fn sink(&self) -> OutputSink {
        OutputSink::new(self.clone())
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
enum Target {
    Buffered(Arc<Mutex<Vec<u8>>>),
    Live {
        sink: OutputSink,
        muted: Arc<AtomicBool>,
    },
}

/// Output handle given to each task invocation
#[derive(Clone)]
pub struct TaskOutput {
    target: Target,
}

impl TaskOutput {
    pub(crate) fn buffered(buffer: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            target: Target::Buffered(buffer),
        }
    }

    pub(crate) fn live(sink: OutputSink, muted: Arc<AtomicBool>) -> Self {
        Self {
            target: Target::Live { sink, muted },
        }
    }

    /// Whether this output streams directly to the sink
    pub fn is_live(&self) -> bool {
        matches!(self.target, Target::Live { .. })
    }

    /// Write one line of output
    pub fn line(&self, line: impl AsRef<str>) {
        let mut bytes = line.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        self.append(&bytes);
    }

    fn append(&self, bytes: &[u8]) {
        match &self.target {
            Target::Buffered(buffer) => lock(buffer).extend_from_slice(bytes),
            Target::Live { sink, muted } => {
                if !muted.load(Ordering::SeqCst) {
                    sink.write_raw(bytes);
                }
            }
        }
    }

    /// Pass what the buffered worker has accumulated to `hand` with the
    /// buffer still locked
    pub(crate) fn hand_over<R>(&self, hand: impl FnOnce(Vec<u8>) -> R) -> R {
        match &self.target {
            Target::Buffered(buffer) => {
                let mut guard = lock(buffer);
                hand(std::mem::take(&mut *guard))
            }
            Target::Live { .. } => hand(Vec::new()),
        }
    }
}

impl Write for TaskOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lock a shared worker buffer
pub(crate) fn lock_buffer(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    lock(buffer)
}
