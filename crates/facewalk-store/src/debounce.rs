//! Per-key debounced writer.
//!
//! A single actor task owns every pending value. Each write to a key replaces
//! its pending value and pushes its deadline out by the window; when the
//! deadline passes, the last value is handed to the sink once. Pending
//! values are flushed on [`DebouncedWriter::flush`] and when the last handle
//! is dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Destination of flushed values.
#[async_trait]
pub trait FlushSink: Send + Sync + 'static {
    async fn flush(&self, key: &Path, contents: &[u8]) -> std::io::Result<()>;
}

/// Writes each key as a file, atomically.
pub struct FileSink;

#[async_trait]
impl FlushSink for FileSink {
    async fn flush(&self, key: &Path, contents: &[u8]) -> std::io::Result<()> {
        crate::paths::write_atomic(key, contents).await
    }
}

enum DebounceRequest {
    Write {
        key: PathBuf,
        contents: Vec<u8>,
    },
    Peek {
        key: PathBuf,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Flush {
        reply: oneshot::Sender<usize>,
    },
}

struct Pending {
    contents: Vec<u8>,
    deadline: Instant,
}

/// Clone-safe handle to the debounce actor.
#[derive(Clone)]
pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<DebounceRequest>,
    physical_writes: Arc<AtomicU64>,
}

impl DebouncedWriter {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(window: Duration, sink: Arc<dyn FlushSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let physical_writes = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_actor(window, sink, rx, physical_writes.clone()));
        Self { tx, physical_writes }
    }

    /// Queue `contents` for `key`, replacing any pending value.
    pub fn write(&self, key: impl Into<PathBuf>, contents: Vec<u8>) {
        let key = key.into();
        if self.tx.send(DebounceRequest::Write { key: key.clone(), contents }).is_err() {
            tracing::warn!(key = %key.display(), "debounce actor gone; write dropped");
        }
    }

    /// Pending (not yet flushed) value for `key`.
    pub async fn peek(&self, key: &Path) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DebounceRequest::Peek {
                key: key.to_path_buf(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Flush every pending value now. Returns how many keys were written.
    pub async fn flush(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DebounceRequest::Flush { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Values handed to the sink since spawn.
    pub fn physical_writes(&self) -> u64 {
        self.physical_writes.load(Ordering::Relaxed)
    }
}

async fn run_actor(
    window: Duration,
    sink: Arc<dyn FlushSink>,
    mut rx: mpsc::UnboundedReceiver<DebounceRequest>,
    physical_writes: Arc<AtomicU64>,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            req = rx.recv() => match req {
                Some(DebounceRequest::Write { key, contents }) => {
                    let deadline = Instant::now() + window;
                    pending.insert(key, Pending { contents, deadline });
                }
                Some(DebounceRequest::Peek { key, reply }) => {
                    let _ = reply.send(pending.get(&key).map(|p| p.contents.clone()));
                }
                Some(DebounceRequest::Flush { reply }) => {
                    let keys: Vec<PathBuf> = pending.keys().cloned().collect();
                    let written = flush_keys(&mut pending, keys, sink.as_ref(), &physical_writes).await;
                    let _ = reply.send(written);
                }
                None => {
                    let keys: Vec<PathBuf> = pending.keys().cloned().collect();
                    let written = flush_keys(&mut pending, keys, sink.as_ref(), &physical_writes).await;
                    tracing::debug!(written, "debounce actor exiting");
                    break;
                }
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                flush_keys(&mut pending, due, sink.as_ref(), &physical_writes).await;
            }
        }
    }
}

async fn flush_keys(
    pending: &mut HashMap<PathBuf, Pending>,
    keys: Vec<PathBuf>,
    sink: &dyn FlushSink,
    physical_writes: &AtomicU64,
) -> usize {
    let mut written = 0;
    for key in keys {
        let Some(entry) = pending.remove(&key) else {
            continue;
        };
        match sink.flush(&key, &entry.contents).await {
            Ok(()) => {
                written += 1;
                physical_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Next pass rewrites it.
                tracing::warn!(key = %key.display(), error = %e, "debounced write failed");
            }
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn writes(&self) -> Vec<(PathBuf, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FlushSink for RecordingSink {
        async fn flush(&self, key: &Path, contents: &[u8]) -> std::io::Result<()> {
            self.writes.lock().unwrap().push((key.to_path_buf(), contents.to_vec()));
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_value() {
        let sink = Arc::new(RecordingSink::default());
        let writer = DebouncedWriter::spawn(WINDOW, sink.clone());

        for i in 0..10u8 {
            writer.write("a.json", vec![i]);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(sink.writes().is_empty());

        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(sink.writes(), vec![(PathBuf::from("a.json"), vec![9])]);
        assert_eq!(writer.physical_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let sink = Arc::new(RecordingSink::default());
        let writer = DebouncedWriter::spawn(WINDOW, sink.clone());

        writer.write("a.json", b"a1".to_vec());
        writer.write("b.json", b"b1".to_vec());
        writer.write("a.json", b"a2".to_vec());
        tokio::time::sleep(WINDOW * 2).await;

        let mut writes = sink.writes();
        writes.sort();
        assert_eq!(
            writes,
            vec![
                (PathBuf::from("a.json"), b"a2".to_vec()),
                (PathBuf::from("b.json"), b"b1".to_vec()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_sees_pending_value() {
        let sink = Arc::new(RecordingSink::default());
        let writer = DebouncedWriter::spawn(WINDOW, sink.clone());

        writer.write("a.json", b"v".to_vec());
        assert_eq!(writer.peek(Path::new("a.json")).await, Some(b"v".to_vec()));
        assert_eq!(writer.peek(Path::new("other.json")).await, None);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(writer.peek(Path::new("a.json")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_everything_now() {
        let sink = Arc::new(RecordingSink::default());
        let writer = DebouncedWriter::spawn(WINDOW, sink.clone());

        writer.write("a.json", b"1".to_vec());
        writer.write("b.json", b"2".to_vec());
        assert_eq!(writer.flush().await, 2);
        assert_eq!(sink.writes().len(), 2);

        // Nothing left for the timer.
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(sink.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_flushes_pending() {
        let sink = Arc::new(RecordingSink::default());
        let writer = DebouncedWriter::spawn(Duration::from_secs(3600), sink.clone());
        writer.write("a.json", b"last".to_vec());
        drop(writer);

        for _ in 0..100 {
            if !sink.writes().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.writes(), vec![(PathBuf::from("a.json"), b"last".to_vec())]);
    }

    #[tokio::test]
    async fn test_file_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DebouncedWriter::spawn(WINDOW, Arc::new(FileSink));
        let path = dir.path().join("x/y.json");
        writer.write(&path, b"{}".to_vec());
        assert_eq!(writer.flush().await, 1);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{}");
    }
}
