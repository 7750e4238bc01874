use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

pub fn clamp_concurrency(limit: usize) -> usize {
    limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Change,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Change => "change",
            OperationKind::Delete => "delete",
        }
    }
}

/// A pending local-origin mutation awaiting dispatch to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub path: String,
    pub enqueued_at: i64,
}

/// FIFO queue drained by a bounded worker pool. The queue only hands out
/// work while the active-worker count is under the limit; the engine
/// re-pumps on every enqueue and on every worker completion.
#[derive(Debug)]
pub struct OperationQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Operation>,
    active: usize,
    limit: usize,
}

impl OperationQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: 0,
                limit: clamp_concurrency(limit),
            }),
        }
    }

    /// Appends an operation and returns the new queue depth.
    pub fn enqueue(&self, op: Operation) -> usize {
        let mut state = self.inner.lock().expect("queue lock");
        state.pending.push_back(op);
        state.pending.len()
    }

    /// Claims the next operation if a worker slot is free, incrementing the
    /// active count. Returns `None` when the queue is empty or saturated.
    pub fn try_claim(&self) -> Option<Operation> {
        let mut state = self.inner.lock().expect("queue lock");
        if state.active >= state.limit {
            return None;
        }
        let op = state.pending.pop_front()?;
        state.active += 1;
        Some(op)
    }

    /// Releases a worker slot after an operation finishes (or fails).
    pub fn complete(&self) {
        let mut state = self.inner.lock().expect("queue lock");
        state.active = state.active.saturating_sub(1);
    }

    /// Drops every pending operation and zeroes the active count without
    /// waiting for in-flight workers.
    pub fn clear(&self) {
        let mut state = self.inner.lock().expect("queue lock");
        state.pending.clear();
        state.active = 0;
    }

    /// Applies a new concurrency limit, clamped to the supported range, and
    /// returns the value that took effect.
    pub fn set_limit(&self, limit: usize) -> usize {
        let mut state = self.inner.lock().expect("queue lock");
        state.limit = clamp_concurrency(limit);
        state.limit
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().expect("queue lock").limit
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.inner.lock().expect("queue lock").active
    }
}
