//! Process-wide counters shared between the reactor and the workers.

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct ServerMetrics {
    active_conns: AtomicUsize,
    total_requests: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            total_requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn conn_opened(&self) -> usize {
        self.active_conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn conn_closed(&self) -> usize {
        self.active_conns.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn request_served(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> usize {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
