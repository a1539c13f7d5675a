//! Bounded database handle pool and the user verification it backs.
//!
//! `HandlePool` is the generic piece: a queue of open handles guarded by a
//! counting semaphore, so `permits + borrowed == pool size` at all times.
//! `SqlPool` specialises it to `mysql::Conn` and implements the two-route
//! login/register check against the `user` table.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;

/// Username/password check, `is_login` selecting login vs. registration.
pub trait Credentials: Send + Sync {
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool;
}

struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.lock();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    fn release(&self) {
        *self.lock() += 1;
        self.cond.notify_one();
    }

    fn available(&self) -> usize {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of open handles; `acquire` blocks until one is free.
pub struct HandlePool<T> {
    handles: Mutex<VecDeque<T>>,
    slots: Semaphore,
    size: usize,
}

impl<T> HandlePool<T> {
    pub fn new(handles: Vec<T>) -> Self {
        let size = handles.len();
        Self {
            handles: Mutex::new(handles.into()),
            slots: Semaphore::new(size),
            size,
        }
    }

    /// Borrow a handle; returned to the pool when the guard drops, on every
    /// exit path of the caller.
    pub fn acquire(&self) -> PooledHandle<'_, T> {
        self.slots.acquire();
        let handle = self
            .lock_handles()
            .pop_front()
            .expect("semaphore permit implies a queued handle");
        PooledHandle {
            pool: self,
            handle: Some(handle),
        }
    }

    /// Drop every queued handle. Called once at shutdown, after the
    /// workers that could borrow from the pool have drained.
    pub fn close(&self) {
        self.lock_handles().clear();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        self.slots.available()
    }

    fn lock_handles(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, handle: T) {
        self.lock_handles().push_back(handle);
        self.slots.release();
    }
}

pub struct PooledHandle<'a, T> {
    pool: &'a HandlePool<T>,
    handle: Option<T>,
}

impl<T> std::ops::Deref for PooledHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl<T> std::ops::DerefMut for PooledHandle<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("handle present until drop")
    }
}

impl<T> Drop for PooledHandle<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// Pool of MySQL connections plus the login/register queries.
pub struct SqlPool {
    pool: HandlePool<Conn>,
}

impl SqlPool {
    /// Open `config.conn_pool_num` connections eagerly. Any failure is
    /// fatal: a pool that silently comes up short would break the permit
    /// accounting.
    pub fn connect(config: &Config) -> Result<Self> {
        let mut handles = Vec::with_capacity(config.conn_pool_num);
        for i in 0..config.conn_pool_num {
            let opts = OptsBuilder::new()
                .ip_or_hostname(Some(config.sql_host.clone()))
                .tcp_port(config.sql_port)
                .user(Some(config.sql_user.clone()))
                .pass(Some(config.sql_pwd.clone()))
                .db_name(Some(config.db_name.clone()));
            let conn = Conn::new(opts)?;
            debug!(index = i, "database connection established");
            handles.push(conn);
        }
        info!(pool_size = handles.len(), "database pool ready");
        Ok(Self {
            pool: HandlePool::new(handles),
        })
    }

    pub fn close_pool(&self) {
        self.pool.close();
    }

    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }
}

impl Credentials for SqlPool {
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }

        let mut conn = self.pool.acquire();
        if is_login {
            match conn.exec_first::<(String, String), _, _>(
                "SELECT username, passwd FROM user WHERE username = ? AND passwd = ?",
                (user, password),
            ) {
                Ok(row) => row.is_some(),
                Err(err) => {
                    warn!(%err, "login query failed");
                    false
                }
            }
        } else {
            match conn.exec_first::<String, _, _>(
                "SELECT username FROM user WHERE username = ?",
                (user,),
            ) {
                Ok(Some(_)) => {
                    debug!(user, "registration rejected: user exists");
                    false
                }
                Ok(None) => match conn.exec_drop(
                    "INSERT INTO user(username, passwd) VALUES(?, ?)",
                    (user, password),
                ) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%err, "user insert failed");
                        false
                    }
                },
                Err(err) => {
                    warn!(%err, "registration lookup failed");
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_returns_handle_on_drop() {
        let pool = HandlePool::new(vec![1, 2, 3]);
        assert_eq!(pool.free_count(), 3);
        {
            let h = pool.acquire();
            assert_eq!(pool.free_count(), 2);
            assert!(*h >= 1 && *h <= 3);
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn permits_plus_borrowed_equals_pool_size() {
        let pool = Arc::new(HandlePool::new((0..4).collect::<Vec<_>>()));
        let borrowed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let borrowed = Arc::clone(&borrowed);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let h = pool.acquire();
                    let now_borrowed = borrowed.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now_borrowed <= pool.size());
                    thread::sleep(Duration::from_micros(50));
                    borrowed.fetch_sub(1, Ordering::SeqCst);
                    drop(h);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(HandlePool::new(vec![0u8]));
        let first = pool.acquire();

        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let _h = pool2.acquire();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(first);
        waiter.join().unwrap();
    }
}
