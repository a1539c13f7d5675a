//! Indexed binary min-heap of per-fd deadlines.
//!
//! Keyed on `Instant` so wall-clock jumps cannot fire or starve timers.
//! `refs` maps a timer id to its current heap index and is fixed up on
//! every swap, giving O(log n) adjustment of an existing timer.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn Fn() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimerCallback,
}

pub struct TimerHeap {
    heap: Vec<TimerNode>,
    refs: HashMap<RawFd, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            refs: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a timer for `id`, or reset an existing one to the new
    /// deadline and callback.
    pub fn add(&mut self, id: RawFd, timeout: Duration, cb: TimerCallback) {
        match self.refs.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.refs.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires: Instant::now() + timeout,
                    cb,
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = Instant::now() + timeout;
                self.heap[i].cb = cb;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Push an existing timer's deadline out to `now + timeout`. Extension
    /// is the common case, so only a sift down is attempted.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        if let Some(&i) = self.refs.get(&id) {
            self.heap[i].expires = Instant::now() + timeout;
            self.sift_down(i, self.heap.len());
        }
    }

    /// Remove the earliest timer.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove(0);
        }
    }

    /// Run and remove every expired timer.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(head) = self.heap.first() {
            if head.expires > now {
                break;
            }
            let node = self.take(0);
            (node.cb)();
        }
    }

    /// Tick, then return milliseconds until the next deadline, clamped at
    /// zero; -1 when no timers remain (wait indefinitely).
    pub fn next_tick_ms(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(head) => {
                let now = Instant::now();
                if head.expires <= now {
                    0
                } else {
                    (head.expires - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.refs.clear();
    }

    fn remove(&mut self, index: usize) {
        self.take(index);
    }

    /// Detach the node at `index`, restoring the heap property.
    fn take(&mut self, index: usize) -> TimerNode {
        debug_assert!(index < self.heap.len());
        let last = self.heap.len() - 1;
        if index < last {
            self.swap_node(index, last);
        }
        let node = self.heap.pop().expect("heap is non-empty");
        self.refs.remove(&node.id);
        if index < self.heap.len() && !self.sift_down(index, self.heap.len()) {
            self.sift_up(index);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            // `<=` keeps equal-deadline parents in place: earlier insertion wins.
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_node(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node actually moved down.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_node(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap_node(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_heap_ok(&self) {
        for i in 0..self.heap.len() {
            assert_eq!(self.refs[&self.heap[i].id], i, "stale ref for index {}", i);
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    self.heap[parent].expires <= self.heap[i].expires,
                    "heap order violated at {}",
                    i
                );
            }
        }
        assert_eq!(self.refs.len(), self.heap.len());
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> TimerCallback {
        Box::new(|| {})
    }

    #[test]
    fn min_heap_invariant_under_mixed_ops() {
        let mut heap = TimerHeap::new();
        for id in 0..32 {
            heap.add(id, Duration::from_millis(1000 - (id as u64 * 13) % 700), noop());
            heap.assert_heap_ok();
        }
        for id in (0..32).step_by(3) {
            heap.adjust(id, Duration::from_millis((id as u64 * 37) % 900 + 1));
            heap.assert_heap_ok();
        }
        while !heap.is_empty() {
            heap.pop();
            heap.assert_heap_ok();
        }
    }

    #[test]
    fn re_add_replaces_instead_of_duplicating() {
        let mut heap = TimerHeap::new();
        heap.add(7, Duration::from_millis(100), noop());
        heap.add(7, Duration::from_millis(900), noop());
        assert_eq!(heap.len(), 1);
        heap.assert_heap_ok();

        heap.add(8, Duration::from_millis(500), noop());
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn tick_fires_expired_callbacks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut heap = TimerHeap::new();
        for id in 0..4 {
            let fired = Arc::clone(&fired);
            heap.add(
                id,
                Duration::from_millis(0),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        heap.add(99, Duration::from_secs(60), noop());

        heap.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 4);
        assert_eq!(heap.len(), 1);
        heap.assert_heap_ok();
    }

    #[test]
    fn next_tick_reports_head_deadline() {
        let mut heap = TimerHeap::new();
        assert_eq!(heap.next_tick_ms(), -1);

        heap.add(1, Duration::from_secs(5), noop());
        let ms = heap.next_tick_ms();
        assert!(ms > 4000 && ms <= 5000, "got {}", ms);
    }

    #[test]
    fn adjust_extends_existing_timer() {
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::from_millis(10), noop());
        heap.add(2, Duration::from_secs(30), noop());
        heap.adjust(1, Duration::from_secs(60));
        heap.assert_heap_ok();

        // Neither timer is due yet, so nothing fires.
        heap.tick();
        assert_eq!(heap.len(), 2);
    }
}
