//! [`TaskEngine`] – a background thread that runs queued work one item at a
//! time, in the order it was submitted.
//!
//! The thread drives a single-threaded tokio runtime.  Callers hand over
//! boxed futures through an unbounded channel and return immediately.  A
//! failing or panicking item is logged and the loop moves on to the next.
//!
//! Shutdown is cooperative: [`TaskEngine::shutdown`] closes the queue,
//! signals cancellation, and joins the thread.  An in-flight item is dropped
//! at its next await point; queued items never start.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ClientError;

/// Queue depth above which every enqueue logs a warning.
pub const QUEUE_WARN_DEPTH: usize = 64;

pub type TaskId = Uuid;

/// A unit of queued work.
pub type TaskWork = BoxFuture<'static, Result<(), ClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Fetch and process telemetry; holds the busy flag while it runs.
    Fetch,
    SendCommand,
    /// Completes once everything queued before it has finished.
    Flush,
}

struct QueuedTask {
    id: TaskId,
    kind: TaskKind,
    work: TaskWork,
}

pub struct TaskEngine {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    cancel: watch::Sender<bool>,
    handle: Handle,
    thread: Mutex<Option<JoinHandle<()>>>,
    busy: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl TaskEngine {
    /// Build the runtime and start the consumer thread.
    ///
    /// # Errors
    ///
    /// [`ClientError::Runtime`] if the runtime or thread cannot be created.
    pub fn start() -> Result<Self, ClientError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let busy = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let thread = {
            let busy = Arc::clone(&busy);
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("digiweight-tasks".to_string())
                .spawn(move || {
                    runtime.block_on(consume(rx, cancel_rx, busy, pending));
                    // Dropping the runtime cancels any detached work.
                    drop(runtime);
                    info!("task engine stopped");
                })?
        };

        info!("task engine started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            cancel,
            handle,
            thread: Mutex::new(Some(thread)),
            busy,
            pending,
        })
    }

    /// Queue `work` behind everything already submitted.
    ///
    /// # Errors
    ///
    /// [`ClientError::EngineStopped`] after [`shutdown`](Self::shutdown).
    pub fn enqueue(&self, kind: TaskKind, work: TaskWork) -> Result<TaskId, ClientError> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(ClientError::EngineStopped)?;

        let id = Uuid::new_v4();
        let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if tx.send(QueuedTask { id, kind, work }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::EngineStopped);
        }

        if depth > QUEUE_WARN_DEPTH {
            warn!(depth, "task queue is backing up");
        }
        debug!(task = %id, ?kind, depth, "task queued");
        Ok(id)
    }

    /// Run `future` on the engine's runtime outside the queue.
    pub fn spawn_detached<F>(&self, future: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(ClientError::EngineStopped);
        }
        self.handle.spawn(future);
        Ok(())
    }

    /// `true` while a [`TaskKind::Fetch`] item is executing.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Items queued but not yet started.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.tx).is_none()
    }

    /// Stop accepting work, cancel what is queued or running, and wait for
    /// the thread to exit.  Safe to call more than once.
    pub fn shutdown(&self) {
        let sender = lock(&self.tx).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.cancel.send_replace(true);

        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // Called from inside a task; the loop exits once this item ends.
            return;
        }
        if thread.join().is_err() {
            error!("task engine thread panicked");
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the busy flag on drop, including when the item is cancelled.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    mut cancel: watch::Receiver<bool>,
    busy: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            next = rx.recv() => match next {
                Some(task) => task,
                None => break,
            },
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        if *cancel.borrow() {
            break;
        }

        let QueuedTask { id, kind, work } = task;
        let _busy = (kind == TaskKind::Fetch).then(|| BusyGuard::set(&busy));
        debug!(task = %id, ?kind, "task started");

        tokio::select! {
            biased;
            _ = cancel.changed() => {
                debug!(task = %id, ?kind, "task cancelled");
                break;
            }
            outcome = AssertUnwindSafe(work).catch_unwind() => match outcome {
                Ok(Ok(())) => debug!(task = %id, ?kind, "task complete"),
                Ok(Err(e)) => warn!(task = %id, ?kind, error = %e, "task failed"),
                Err(_) => error!(task = %id, ?kind, "task panicked"),
            },
        }
    }
    // Whatever is left in the queue is dropped unstarted.
    rx.close();
    while let Ok(task) = rx.try_recv() {
        pending.fetch_sub(1, Ordering::SeqCst);
        debug!(task = %task.id, kind = ?task.kind, "task dropped unstarted");
    }
}
