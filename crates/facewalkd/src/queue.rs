//! Concurrency-limited task queue.
//!
//! At most `concurrency` tasks run at once; the rest wait and are started
//! oldest-first (FIFO) or newest-first (LIFO). Each task runs in its own
//! tokio task, so a failing or panicking task only rejects its own handle.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};

/// Buffered progress events per subscriber before older ones are dropped.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    Fifo,
    #[default]
    Lifo,
}

impl std::str::FromStr for QueueOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            other => Err(format!("unknown queue order: {other}")),
        }
    }
}

/// Snapshot published after every submit, start and finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    pub waiting: usize,
    pub in_flight: usize,
    pub completed: u64,
}

impl QueueProgress {
    pub fn is_idle(&self) -> bool {
        self.waiting == 0 && self.in_flight == 0
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("task panicked")]
    Panicked,
    #[error("task cancelled before it started")]
    Cancelled,
}

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct State {
    waiting: VecDeque<Job>,
    in_flight: usize,
    completed: u64,
}

struct Inner {
    concurrency: usize,
    order: QueueOrder,
    state: Mutex<State>,
    progress: watch::Sender<QueueProgress>,
    events: broadcast::Sender<QueueProgress>,
}

/// Clone-safe handle to a bounded queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

/// Resolves with the task's output once it has run (or been cleared).
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(QueueError::Cancelled)))
    }
}

impl TaskQueue {
    pub fn new(concurrency: usize, order: QueueOrder) -> Self {
        let (progress, _) = watch::channel(QueueProgress::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                concurrency: concurrency.max(1),
                order,
                state: Mutex::new(State {
                    waiting: VecDeque::new(),
                    in_flight: 0,
                    completed: 0,
                }),
                progress,
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        let snapshot = QueueProgress {
            waiting: state.waiting.len(),
            in_flight: state.in_flight,
            completed: state.completed,
        };
        self.inner.progress.send_replace(snapshot);
        let _ = self.inner.events.send(snapshot);
    }

    /// Enqueue a task. Must be called from within a tokio runtime.
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let outcome = match tokio::spawn(task()).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(QueueError::Failed(e)),
                    Err(e) if e.is_panic() => Err(QueueError::Panicked),
                    Err(_) => Err(QueueError::Cancelled),
                };
                let _ = tx.send(outcome);
            })
        });

        {
            let mut state = self.lock();
            state.waiting.push_back(job);
            self.publish(&state);
        }
        self.pump();
        TaskHandle { rx }
    }

    fn pump(&self) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.in_flight >= self.inner.concurrency {
                    return;
                }
                let next = match self.inner.order {
                    QueueOrder::Fifo => state.waiting.pop_front(),
                    QueueOrder::Lifo => state.waiting.pop_back(),
                };
                let Some(job) = next else {
                    return;
                };
                state.in_flight += 1;
                self.publish(&state);
                job
            };

            let queue = self.clone();
            tokio::spawn(async move {
                job().await;
                queue.finish();
            });
        }
    }

    fn finish(&self) {
        {
            let mut state = self.lock();
            state.in_flight -= 1;
            state.completed += 1;
            self.publish(&state);
        }
        self.pump();
    }

    /// Cancel every task that has not started yet. Running tasks are unaffected.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Job> = {
            let mut state = self.lock();
            let dropped = state.waiting.drain(..).collect();
            self.publish(&state);
            dropped
        };
        // Dropping a job drops its reply sender, which cancels the handle.
        dropped.len()
    }

    /// Resolves once nothing is waiting or running.
    pub async fn drain(&self) {
        let mut rx = self.inner.progress.subscribe();
        let _ = rx.wait_for(QueueProgress::is_idle).await;
    }

    pub fn progress(&self) -> QueueProgress {
        *self.inner.progress.borrow()
    }

    /// Stream of every progress transition.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueProgress> {
        self.inner.events.subscribe()
    }
}
