//! Bookkeeping for rate-limited task queues.
//!
//! [`TaskLedger`] decides which task may start next and which results are
//! ready to hand back; the runtime owns the actual futures and timers.

use crate::error::SyncError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the start-rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// No window open.
    Idle,
    /// Window open, starts still available.
    Draining { window_end: Instant, starts: u32 },
    /// Window open, start budget spent until `window_end`.
    Throttled { window_end: Instant },
}

/// Start-rate limiter over a rolling window that opens on the first start.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_starts: u32,
    state: LimiterState,
}

impl RateLimiter {
    pub fn new(max_starts: u32) -> Self {
        Self {
            max_starts: max_starts.max(1),
            state: LimiterState::Idle,
        }
    }

    pub fn state(&self) -> LimiterState {
        self.state
    }

    /// Closes the current window once it has elapsed.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            LimiterState::Draining { window_end, .. } | LimiterState::Throttled { window_end }
                if now >= window_end =>
            {
                self.state = LimiterState::Idle;
            }
            _ => {}
        }
    }

    /// Takes one start from the budget, or reports when the window reopens.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        self.tick(now);
        let (window_end, starts) = match self.state {
            LimiterState::Idle => (now + RATE_WINDOW, 1),
            LimiterState::Draining { window_end, starts } => (window_end, starts + 1),
            LimiterState::Throttled { window_end } => return Err(window_end),
        };
        self.state = if starts >= self.max_starts {
            LimiterState::Throttled { window_end }
        } else {
            LimiterState::Draining { window_end, starts }
        };
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = LimiterState::Idle;
    }
}

#[derive(Debug)]
struct Slot<T, D> {
    id: TaskId,
    transaction_id: u64,
    params: Option<T>,
    outcome: Option<Result<D, SyncError>>,
    cancelled: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    Start { id: TaskId, params: T },
    /// The head was cancelled while queued and completed without running.
    Skipped(TaskId),
    /// Rate budget spent; check again at the given instant.
    Throttled(Instant),
    /// All parallel slots taken.
    Saturated,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    /// Not started yet; it resolves as cancelled when it reaches the head.
    Queued(TaskId),
    /// Running; only the queue's cancel hook can stop it.
    InFlight(TaskId),
    /// Already finished, waiting for earlier tasks to resolve.
    Finished(TaskId),
    NotFound,
}

/// FIFO task bookkeeping with bounded parallelism and a start-rate limit.
///
/// `executing` holds started tasks in submission order, including ones that
/// finished but wait for an earlier task before they can resolve.
#[derive(Debug)]
pub struct TaskLedger<T, D> {
    parallel: usize,
    next_id: TaskId,
    queued: VecDeque<Slot<T, D>>,
    executing: VecDeque<Slot<T, D>>,
    limiter: RateLimiter,
}

impl<T, D> TaskLedger<T, D> {
    pub fn new(parallel: usize, max_starts_per_window: u32) -> Self {
        Self {
            parallel: parallel.max(1),
            next_id: 0,
            queued: VecDeque::new(),
            executing: VecDeque::new(),
            limiter: RateLimiter::new(max_starts_per_window),
        }
    }

    pub fn push(&mut self, transaction_id: u64, params: T) -> TaskId {
        self.next_id += 1;
        self.queued.push_back(Slot {
            id: self.next_id,
            transaction_id,
            params: Some(params),
            outcome: None,
            cancelled: false,
        });
        self.next_id
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.executing.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.executing.is_empty()
    }

    pub fn limiter_state(&self) -> LimiterState {
        self.limiter.state()
    }

    /// Decides what happens to the head of the queue.
    pub fn admit(&mut self, now: Instant) -> Admission<T> {
        if self.queued.is_empty() {
            return Admission::Empty;
        }
        if self.executing.len() >= self.parallel {
            return Admission::Saturated;
        }

        if self.queued.front().is_some_and(|slot| slot.cancelled) {
            let Some(mut slot) = self.queued.pop_front() else {
                return Admission::Empty;
            };
            slot.params = None;
            slot.outcome = Some(Err(SyncError::TaskCancelled));
            let id = slot.id;
            self.executing.push_back(slot);
            return Admission::Skipped(id);
        }

        if let Err(retry_at) = self.limiter.try_acquire(now) {
            return Admission::Throttled(retry_at);
        }

        let Some(mut slot) = self.queued.pop_front() else {
            return Admission::Empty;
        };
        let id = slot.id;
        let params = slot.params.take();
        self.executing.push_back(slot);
        match params {
            Some(params) => Admission::Start { id, params },
            None => Admission::Skipped(id),
        }
    }

    /// Records the outcome of a started task. A task cancelled while in
    /// flight resolves as cancelled whatever it returned.
    pub fn complete(&mut self, id: TaskId, outcome: Result<D, SyncError>) {
        if let Some(slot) = self.executing.iter_mut().find(|slot| slot.id == id) {
            slot.outcome = Some(if slot.cancelled {
                Err(SyncError::TaskCancelled)
            } else {
                outcome
            });
        }
    }

    /// Pops finished tasks from the head of the in-flight list, stopping at
    /// the first one still running.
    pub fn drain_resolved(&mut self) -> Vec<(TaskId, Result<D, SyncError>)> {
        let mut resolved = Vec::new();
        while self
            .executing
            .front()
            .is_some_and(|slot| slot.outcome.is_some())
        {
            if let Some(Slot {
                id,
                outcome: Some(outcome),
                ..
            }) = self.executing.pop_front()
            {
                resolved.push((id, outcome));
            }
        }
        resolved
    }

    /// Locates the task for `transaction_id`, marking it cancelled when it has
    /// not started yet.
    pub fn cancel(&mut self, transaction_id: u64) -> CancelTarget {
        if let Some(slot) = self
            .queued
            .iter_mut()
            .find(|slot| slot.transaction_id == transaction_id && !slot.cancelled)
        {
            slot.cancelled = true;
            return CancelTarget::Queued(slot.id);
        }
        match self
            .executing
            .iter()
            .find(|slot| slot.transaction_id == transaction_id)
        {
            Some(slot) if slot.outcome.is_some() => CancelTarget::Finished(slot.id),
            Some(slot) if !slot.cancelled => CancelTarget::InFlight(slot.id),
            _ => CancelTarget::NotFound,
        }
    }

    /// Marks an in-flight task cancelled after its cancel hook succeeded.
    pub fn mark_cancelled(&mut self, id: TaskId) {
        if let Some(slot) = self.executing.iter_mut().find(|slot| slot.id == id) {
            slot.cancelled = true;
        }
    }

    /// Forgets every task and returns their ids so callers can be told.
    pub fn clear(&mut self) -> Vec<TaskId> {
        self.limiter.reset();
        self.executing
            .drain(..)
            .chain(self.queued.drain(..))
            .map(|slot| slot.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_id(admission: Admission<&'static str>) -> TaskId {
        match admission {
            Admission::Start { id, .. } => id,
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_limiter_states() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(2);
        assert_eq!(limiter.state(), LimiterState::Idle);
        assert!(limiter.try_acquire(t0).is_ok());
        assert!(matches!(
            limiter.state(),
            LimiterState::Draining { starts: 1, .. }
        ));
        assert!(limiter.try_acquire(t0).is_ok());
        assert!(matches!(limiter.state(), LimiterState::Throttled { .. }));
        assert_eq!(limiter.try_acquire(t0), Err(t0 + RATE_WINDOW));

        limiter.tick(t0 + RATE_WINDOW);
        assert_eq!(limiter.state(), LimiterState::Idle);
        assert!(limiter.try_acquire(t0 + RATE_WINDOW).is_ok());
    }

    #[test]
    fn test_fifo_resolution_with_out_of_order_completion() {
        let now = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(3, 10);
        ledger.push(1, "t1");
        ledger.push(2, "t2");
        ledger.push(3, "t3");
        let t1 = start_id(ledger.admit(now));
        let t2 = start_id(ledger.admit(now));
        let t3 = start_id(ledger.admit(now));
        assert_eq!(ledger.admit(now), Admission::Empty);

        ledger.complete(t2, Ok(2));
        assert!(ledger.drain_resolved().is_empty());
        ledger.complete(t3, Ok(3));
        ledger.complete(t1, Ok(1));
        assert_eq!(
            ledger.drain_resolved(),
            vec![(t1, Ok(1)), (t2, Ok(2)), (t3, Ok(3))]
        );
        assert!(ledger.is_idle());
    }

    #[test]
    fn test_parallel_bound_counts_unresolved_tasks() {
        let now = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(1, 10);
        ledger.push(1, "a");
        ledger.push(2, "b");
        let a = start_id(ledger.admit(now));
        assert_eq!(ledger.admit(now), Admission::Saturated);
        ledger.complete(a, Ok(0));
        assert_eq!(ledger.drain_resolved().len(), 1);
        start_id(ledger.admit(now));
    }

    #[test]
    fn test_rate_limit_defers_extra_starts() {
        let t0 = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(10, 5);
        for tid in 0..7 {
            ledger.push(tid, "job");
        }
        let mut started = 0;
        loop {
            match ledger.admit(t0) {
                Admission::Start { .. } => started += 1,
                Admission::Throttled(at) => {
                    assert_eq!(at, t0 + RATE_WINDOW);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(started, 5);
        assert_eq!(ledger.queued_len(), 2);

        let later = t0 + RATE_WINDOW;
        start_id(ledger.admit(later));
        start_id(ledger.admit(later));
        assert_eq!(ledger.admit(later), Admission::Empty);
    }

    #[test]
    fn test_cancel_queued_task_skips_work() {
        let now = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(1, 10);
        ledger.push(1, "a");
        ledger.push(2, "b");
        ledger.push(3, "c");
        let a = start_id(ledger.admit(now));

        let CancelTarget::Queued(b) = ledger.cancel(2) else {
            panic!("expected queued task");
        };
        assert_eq!(ledger.cancel(1), CancelTarget::InFlight(a));
        assert_eq!(ledger.cancel(99), CancelTarget::NotFound);

        ledger.complete(a, Ok(1));
        assert_eq!(ledger.drain_resolved(), vec![(a, Ok(1))]);
        assert_eq!(ledger.admit(now), Admission::Skipped(b));
        assert_eq!(
            ledger.drain_resolved(),
            vec![(b, Err(SyncError::TaskCancelled))]
        );
        assert!(ledger.admit(now).is_start());
    }

    #[test]
    fn test_in_flight_cancel_overrides_outcome() {
        let now = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(2, 10);
        ledger.push(5, "upload");
        let id = start_id(ledger.admit(now));
        ledger.mark_cancelled(id);
        assert_eq!(ledger.cancel(5), CancelTarget::NotFound);
        ledger.complete(id, Ok(100));
        assert_eq!(
            ledger.drain_resolved(),
            vec![(id, Err(SyncError::TaskCancelled))]
        );
    }

    #[test]
    fn test_clear_returns_outstanding_ids() {
        let now = Instant::now();
        let mut ledger: TaskLedger<&str, u32> = TaskLedger::new(1, 10);
        ledger.push(1, "a");
        ledger.push(2, "b");
        let a = start_id(ledger.admit(now));
        let ids = ledger.clear();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], a);
        assert!(ledger.is_idle());
    }

    impl<T> Admission<T> {
        fn is_start(&self) -> bool {
            matches!(self, Admission::Start { .. })
        }
    }
}
