// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO with optional blocking on either end.
//!
//! [`Que`] is the single-core queue primitive under [`crate::BufQue`]. A get on
//! an empty queue (or a put on a full one) either fails immediately or, when the
//! queue was created blocking on that side, waits for the peer up to the given
//! [`Timeout`]. Waiters are woken one at a time as items move.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::{Error, Result};

/// Hard upper bound on the capacity of any queue.
pub const QUE_MAX_ELEMENTS: usize = 384;

/// How long a blocking get or put may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    NoWait,
    Forever,
    After(Duration),
}

impl Timeout {
    fn deadline(self) -> Option<Option<Instant>> {
        match self {
            Timeout::NoWait => None,
            Timeout::Forever => Some(None),
            Timeout::After(duration) => Some(Some(Instant::now() + duration)),
        }
    }
}

/// Occupancy counters of a [`Que`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueStats {
    pub puts: u64,
    pub gets: u64,
    /// Gets that found the queue empty and gave up.
    pub get_misses: u64,
    /// Puts that found the queue full and gave up.
    pub put_rejects: u64,
    /// Highest occupancy seen.
    pub max_depth: usize,
}

/// A put that could not be completed. The item is handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub error: Error,
}

struct QueState<T> {
    items: VecDeque<T>,
    stats: QueStats,
    shutdown: bool,
}

/// Bounded FIFO queue.
///
/// # Examples
///
/// ```
/// use links::que::{Que, Timeout};
///
/// # fn main() -> Result<(), links::Error> {
/// let que = Que::new(2, false, false)?;
/// que.put(1, Timeout::NoWait).map_err(|r| r.error)?;
/// que.put(2, Timeout::NoWait).map_err(|r| r.error)?;
/// assert!(que.put(3, Timeout::NoWait).is_err());
/// assert_eq!(que.get(Timeout::NoWait)?, 1);
/// # Ok(())
/// # }
/// ```
pub struct Que<T> {
    capacity: usize,
    block_on_get: bool,
    block_on_put: bool,
    state: Mutex<QueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Que<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of slots, `1..=QUE_MAX_ELEMENTS`
    /// * `block_on_get` - Whether [`Que::get`] honours its timeout when empty
    /// * `block_on_put` - Whether [`Que::put`] honours its timeout when full
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if the capacity is out of range.
    pub fn new(capacity: usize, block_on_get: bool, block_on_put: bool) -> Result<Self> {
        if capacity == 0 || capacity > QUE_MAX_ELEMENTS {
            return Err(Error::InvalidParams(format!(
                "Queue capacity {capacity} outside 1..={QUE_MAX_ELEMENTS}."
            )));
        }
        Ok(Self {
            capacity,
            block_on_get,
            block_on_put,
            state: Mutex::new(QueState {
                items: VecDeque::with_capacity(capacity),
                stats: QueStats::default(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Appends an item at the tail.
    ///
    /// # Errors
    ///
    /// The item is returned inside [`Rejected`] with [`Error::QueueFull`] (no
    /// wait), [`Error::Timeout`] (wait expired) or [`Error::InvalidState`] (queue
    /// shut down).
    pub fn put(&self, item: T, timeout: Timeout) -> core::result::Result<(), Rejected<T>> {
        let timeout = if self.block_on_put {
            timeout
        } else {
            Timeout::NoWait
        };
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            let error = match timeout.deadline() {
                None => Some(Error::QueueFull),
                Some(deadline) => {
                    Self::wait_while(&self.not_full, &mut state, deadline, |s| {
                        s.items.len() >= self.capacity
                    })
                }
            };
            if let Some(error) = error {
                state.stats.put_rejects += 1;
                return Err(Rejected { item, error });
            }
        }
        state.items.push_back(item);
        state.stats.puts += 1;
        state.stats.max_depth = state.stats.max_depth.max(state.items.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the item at the head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] when empty without waiting,
    /// [`Error::Timeout`] when a bounded wait expires, and
    /// [`Error::InvalidState`] if the queue was shut down while waiting.
    pub fn get(&self, timeout: Timeout) -> Result<T> {
        let timeout = if self.block_on_get {
            timeout
        } else {
            Timeout::NoWait
        };
        let mut state = self.state.lock();
        if state.items.is_empty() {
            let error = match timeout.deadline() {
                None => Some(Error::NotReady),
                Some(deadline) => {
                    Self::wait_while(&self.not_empty, &mut state, deadline, |s| s.items.is_empty())
                }
            };
            if let Some(error) = error {
                state.stats.get_misses += 1;
                return Err(error);
            }
        }
        let item = state.items.pop_front().ok_or(Error::NotReady)?;
        state.stats.gets += 1;
        drop(state);
        self.not_full.notify_one();
        Ok(item)
    }

    /// Looks at the head without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.state.lock().items.front())
    }

    /// Removes every queued item, waking blocked writers.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Wakes every blocked caller with [`Error::InvalidState`]; later blocking
    /// calls fail immediately instead of waiting.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueStats {
        self.state.lock().stats
    }

    /// Waits on `cond` while `blocked` holds. Returns the error to report, or
    /// `None` once the condition cleared.
    fn wait_while(
        cond: &Condvar,
        state: &mut parking_lot::MutexGuard<'_, QueState<T>>,
        deadline: Option<Instant>,
        blocked: impl Fn(&QueState<T>) -> bool,
    ) -> Option<Error> {
        while blocked(state) {
            if state.shutdown {
                return Some(Error::InvalidState("queue shut down".into()));
            }
            match deadline {
                None => cond.wait(state),
                Some(deadline) => {
                    if cond.wait_until(state, deadline).timed_out() && blocked(state) {
                        return Some(Error::Timeout);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn capacity_bounds() {
        assert!(Que::<u8>::new(0, false, false).is_err());
        assert!(Que::<u8>::new(QUE_MAX_ELEMENTS + 1, false, false).is_err());
        assert!(Que::<u8>::new(QUE_MAX_ELEMENTS, false, false).is_ok());
    }

    #[test]
    fn full_put_hands_item_back() {
        let que = Que::new(1, false, true).unwrap();
        que.put("a", Timeout::NoWait).unwrap();
        let rejected = que
            .put("b", Timeout::After(Duration::from_millis(5)))
            .unwrap_err();
        assert_eq!(rejected.item, "b");
        assert!(matches!(rejected.error, Error::Timeout));
        assert_eq!(que.stats().put_rejects, 1);
    }

    #[test]
    fn non_blocking_get_ignores_timeout() {
        let que = Que::<u32>::new(4, false, false).unwrap();
        let start = Instant::now();
        assert!(matches!(que.get(Timeout::Forever), Err(Error::NotReady)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn shutdown_wakes_blocked_getter() {
        let que = Arc::new(Que::<u32>::new(4, true, false).unwrap());
        let waiter = {
            let que = que.clone();
            thread::spawn(move || que.get(Timeout::Forever))
        };
        thread::sleep(Duration::from_millis(20));
        que.shutdown();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn peek_and_depth() {
        let que = Que::new(8, false, false).unwrap();
        for i in 0..5 {
            que.put(i, Timeout::NoWait).unwrap();
        }
        assert_eq!(que.peek(|head| head.copied()), Some(0));
        assert_eq!(que.drain(), vec![0, 1, 2, 3, 4]);
        assert_eq!(que.stats().max_depth, 5);
        assert!(que.is_empty());
    }
}
