//! Runtime driver for the rate-limited task queues.
//!
//! The bookkeeping lives in [`chatcore::queue::TaskLedger`]; this module owns
//! the tokio side: spawning started tasks, handing results back through
//! oneshot channels in submission order, and re-arming the admission check
//! when the start-rate window rolls over.

use async_trait::async_trait;
use chatcore::SyncError;
use chatcore::queue::{Admission, CancelTarget, LimiterState, TaskId, TaskLedger};
use log::{debug, trace};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Parameters of a queued job. The transaction id is what callers cancel by.
pub trait QueuedJob: Send + 'static {
    fn transaction_id(&self) -> u64;
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Job: QueuedJob;
    type Output: Send + 'static;

    async fn run(&self, job: Self::Job) -> Result<Self::Output, SyncError>;

    /// Tries to stop a running job. Returning false lets it run to completion.
    fn cancel_in_flight(&self, _transaction_id: u64) -> bool {
        false
    }
}

type Outcome<D> = Result<D, SyncError>;

struct QueueState<T, D> {
    ledger: TaskLedger<T, D>,
    waiters: HashMap<TaskId, oneshot::Sender<Outcome<D>>>,
    timer: Option<JoinHandle<()>>,
}

/// Resolves to the task's result once every earlier task has resolved.
/// A queue shutdown resolves it as cancelled.
pub struct TaskTicket<D> {
    rx: oneshot::Receiver<Outcome<D>>,
}

impl<D> Future for TaskTicket<D> {
    type Output = Outcome<D>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SyncError::TaskCancelled)))
    }
}

pub struct TaskQueue<H: TaskHandler> {
    name: &'static str,
    handler: Arc<H>,
    state: Mutex<QueueState<H::Job, H::Output>>,
}

impl<H: TaskHandler> TaskQueue<H> {
    pub fn new(name: &'static str, handler: Arc<H>, parallel: usize, fps: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            handler,
            state: Mutex::new(QueueState {
                ledger: TaskLedger::new(parallel, fps),
                waiters: HashMap::new(),
                timer: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState<H::Job, H::Output>> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Enqueues a job. It is admitted right away when a slot and start budget
    /// are available.
    pub fn push(self: &Arc<Self>, job: H::Job) -> TaskTicket<H::Output> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            let id = state.ledger.push(job.transaction_id(), job);
            state.waiters.insert(id, tx);
        }
        self.pump();
        TaskTicket { rx }
    }

    fn pump(self: &Arc<Self>) {
        let mut state = self.state();
        loop {
            match state.ledger.admit(Instant::now().into_std()) {
                Admission::Start { id, params } => {
                    trace!(target: self.name, "starting task {id}");
                    let queue = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = queue.handler.run(params).await;
                        queue.finish(id, outcome);
                    });
                }
                Admission::Skipped(id) => {
                    debug!(target: self.name, "task {id} was cancelled before it started");
                }
                Admission::Throttled(retry_at) => {
                    if state.timer.as_ref().is_none_or(|t| t.is_finished()) {
                        debug!(target: self.name, "start rate reached, waiting for the next window");
                        let queue = Arc::clone(self);
                        state.timer = Some(tokio::spawn(async move {
                            tokio::time::sleep_until(Instant::from_std(retry_at)).await;
                            queue.state().timer = None;
                            queue.pump();
                        }));
                    }
                    break;
                }
                Admission::Saturated | Admission::Empty => break,
            }
        }
        Self::deliver(&mut state);
    }

    fn deliver(state: &mut QueueState<H::Job, H::Output>) {
        for (id, outcome) in state.ledger.drain_resolved() {
            if let Some(tx) = state.waiters.remove(&id) {
                // The caller may have stopped waiting.
                let _ = tx.send(outcome);
            }
        }
    }

    fn finish(self: &Arc<Self>, id: TaskId, outcome: Outcome<H::Output>) {
        {
            let mut state = self.state();
            state.ledger.complete(id, outcome);
            Self::deliver(&mut state);
        }
        self.pump();
    }

    /// Best-effort cancellation by transaction id. Queued tasks always resolve
    /// as cancelled; running ones only when the handler manages to stop them.
    pub fn remove(self: &Arc<Self>, transaction_id: u64) -> bool {
        let target = self.state().ledger.cancel(transaction_id);
        match target {
            CancelTarget::Queued(id) => {
                debug!(target: self.name, "cancelled queued task {id}");
                self.pump();
                true
            }
            CancelTarget::InFlight(id) => {
                if !self.handler.cancel_in_flight(transaction_id) {
                    return false;
                }
                debug!(target: self.name, "cancelled running task {id}");
                self.state().ledger.mark_cancelled(id);
                true
            }
            CancelTarget::Finished(_) | CancelTarget::NotFound => false,
        }
    }

    /// Drops every task and stops the rate timer. Pending tickets resolve as
    /// cancelled; running jobs finish on their own but their results are
    /// discarded.
    pub fn shutdown(&self) {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.ledger.clear();
        state.waiters.clear();
        if !dropped.is_empty() {
            debug!(target: self.name, "dropped {} tasks on shutdown", dropped.len());
        }
    }

    pub fn queued_len(&self) -> usize {
        self.state().ledger.queued_len()
    }

    pub fn in_flight(&self) -> usize {
        self.state().ledger.in_flight()
    }

    pub fn limiter_state(&self) -> LimiterState {
        self.state().ledger.limiter_state()
    }
}
