use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::call::FunctionCall;

/// Per-connector overflow queue: unbounded in element count, bounded by a
/// byte budget. On overflow the oldest entries are evicted and returned to
/// the caller so it can fail their callbacks (drop-oldest, not drop-newest).
pub struct LimitedByteQueue {
    inner: Mutex<VecDeque<Arc<FunctionCall>>>,
    byte_size: AtomicU64,
    max_byte_size: AtomicU64,
}

impl LimitedByteQueue {
    pub fn new(max_byte_size: u64) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            byte_size: AtomicU64::new(0),
            max_byte_size: AtomicU64::new(max_byte_size),
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::Acquire)
    }

    pub fn max_byte_size(&self) -> u64 {
        self.max_byte_size.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adjusts the byte budget and returns whatever no longer fits.
    pub fn set_max_byte_size(&self, max_byte_size: u64) -> Vec<Arc<FunctionCall>> {
        self.max_byte_size.store(max_byte_size, Ordering::Release);
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        self.evict_overflow(&mut queue)
    }

    /// Appends the call and returns the evicted oldest entries, possibly
    /// including the call itself when it alone exceeds the budget.
    pub fn push(&self, call: Arc<FunctionCall>) -> Vec<Arc<FunctionCall>> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        self.byte_size.fetch_add(call.byte_size(), Ordering::AcqRel);
        queue.push_back(call);
        self.evict_overflow(&mut queue)
    }

    fn evict_overflow(
        &self,
        queue: &mut VecDeque<Arc<FunctionCall>>,
    ) -> Vec<Arc<FunctionCall>> {
        let max = self.max_byte_size.load(Ordering::Acquire);
        let mut evicted = Vec::new();
        while self.byte_size.load(Ordering::Acquire) > max {
            match queue.pop_front() {
                Some(old) => {
                    self.byte_size.fetch_sub(old.byte_size(), Ordering::AcqRel);
                    evicted.push(old);
                }
                None => break,
            }
        }
        evicted
    }

    /// Next call still awaiting an outcome. Calls completed while queued
    /// (cancellation) are dropped on the way.
    pub fn pop(&self) -> Option<Arc<FunctionCall>> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        while let Some(call) = queue.pop_front() {
            self.byte_size.fetch_sub(call.byte_size(), Ordering::AcqRel);
            if !call.is_completed() {
                return Some(call);
            }
        }
        None
    }

    /// Empties the queue, returning everything that still awaits an outcome.
    pub fn drain(&self) -> Vec<Arc<FunctionCall>> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        self.byte_size.store(0, Ordering::Release);
        queue.drain(..).filter(|c| !c.is_completed()).collect()
    }
}
