//! Single-slot latest-wins handoff between two threads.
//!
//! The producer never blocks: `put` replaces whatever is pending and hands the
//! displaced value back so the caller can count it. The consumer waits with a
//! timeout so it can poll a stop flag. Depth is therefore 0 or 1 at all times.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    Item(T),
    /// Nothing arrived within the timeout.
    Empty,
    /// The slot is closed and drained.
    Closed,
}

struct SlotState<T> {
    item: Option<T>,
    closed: bool,
    displaced: u64,
}

pub struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                item: None,
                closed: false,
                displaced: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        // A poisoned slot still holds consistent data; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `item`, returning the value it displaced. After `close` the item is
    /// handed straight back.
    pub fn put(&self, item: T) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return Some(item);
        }
        let displaced = state.item.replace(item);
        if displaced.is_some() {
            state.displaced += 1;
        }
        drop(state);
        self.ready.notify_one();
        displaced
    }

    /// Take the pending item, waiting up to `timeout` for one. A pending item is
    /// still delivered after `close`.
    pub fn take_timeout(&self, timeout: Duration) -> Take<T> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.item.is_none() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match state.item.take() {
            Some(item) => Take::Item(item),
            None if state.closed => Take::Closed,
            None => Take::Empty,
        }
    }

    pub fn try_take(&self) -> Take<T> {
        let mut state = self.lock();
        match state.item.take() {
            Some(item) => Take::Item(item),
            None if state.closed => Take::Closed,
            None => Take::Empty,
        }
    }

    /// Stop accepting items and wake any waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Items currently pending (0 or 1).
    pub fn depth(&self) -> usize {
        usize::from(self.lock().item.is_some())
    }

    /// Items replaced before a consumer took them.
    pub fn displaced(&self) -> u64 {
        self.lock().displaced
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
