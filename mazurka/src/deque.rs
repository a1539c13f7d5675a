//! Bounded blocking deque with a terminal closed state.
//!
//! Producer and consumer sides wait on separate condition variables.
//! `close` clears the queue and wakes every waiter; items pushed before a
//! close that are still queued are drained before `pop_front` reports the
//! closed state.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BlockDeque<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    consumer: Condvar,
    producer: Condvar,
}

impl<T> BlockDeque<T> {
    /// Capacity must be nonzero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity,
            consumer: Condvar::new(),
            producer: Condvar::new(),
        }
    }

    // A poisoned queue only means some other thread panicked mid-push; the
    // data itself is still coherent, so keep serving instead of unwinding.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail, waiting while the deque is full. Discards the
    /// item silently once the deque is closed.
    pub fn push_back(&self, item: T) {
        let mut inner = self.lock();
        while inner.items.len() >= self.capacity {
            if inner.closed {
                return;
            }
            inner = self.producer.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        if inner.closed {
            return;
        }
        inner.items.push_back(item);
        drop(inner);
        self.consumer.notify_one();
    }

    /// Prepend at the head, waiting while the deque is full. Discards the
    /// item silently once the deque is closed.
    pub fn push_front(&self, item: T) {
        let mut inner = self.lock();
        while inner.items.len() >= self.capacity {
            if inner.closed {
                return;
            }
            inner = self.producer.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        if inner.closed {
            return;
        }
        inner.items.push_front(item);
        drop(inner);
        self.consumer.notify_one();
    }

    /// Pop the head, waiting while the deque is empty. Returns `None` only
    /// once the deque is both closed and drained.
    pub fn pop_front(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.consumer.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `pop_front`, giving up after `timeout`.
    pub fn pop_front_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .consumer
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Clear the contents, set the closed flag, wake every waiter.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.items.clear();
            inner.closed = true;
        }
        self.producer.notify_all();
        self.consumer.notify_all();
    }

    /// Wake all consumers without touching the contents.
    pub fn flush(&self) {
        self.consumer.notify_all();
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = BlockDeque::new(8);
        q.push_back(1);
        q.push_back(2);
        q.push_front(0);
        assert_eq!(q.pop_front(), Some(0));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
    }

    #[test]
    fn producer_unblocks_after_consume() {
        let q = Arc::new(BlockDeque::new(1));
        q.push_back(1u32);

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            // Blocks until the consumer below makes room.
            q2.push_back(2);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop_front(), Some(1));
        producer.join().unwrap();
        assert_eq!(q.pop_front(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let q = Arc::new(BlockDeque::<u32>::new(4));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q2 = Arc::clone(&q);
            handles.push(thread::spawn(move || q2.pop_front()));
        }

        thread::sleep(Duration::from_millis(50));
        q.close();
        for h in handles {
            assert_eq!(h.join().unwrap(), None);
        }
    }

    #[test]
    fn push_after_close_is_discarded() {
        let q = BlockDeque::new(4);
        q.close();
        q.push_back(7);
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn pop_timeout_expires() {
        let q = BlockDeque::<u32>::new(4);
        let start = Instant::now();
        assert_eq!(q.pop_front_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn queued_items_observable_while_closing() {
        // Items still queued when the consumer races a flush-then-close are
        // served before the closed state is reported.
        let q = BlockDeque::new(4);
        q.push_back(1);
        q.push_back(2);
        {
            let mut inner = q.lock();
            inner.closed = true;
        }
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), None);
    }
}
