//! The reactor: listening socket, demultiplexer, timer heap, worker pool,
//! and the `fd -> Connection` map.
//!
//! Only the reactor thread mutates the map, the timer heap and the event
//! buffer. Connection buffers are touched exclusively by the worker task
//! currently dispatched for that fd; `ONE_SHOT` registration guarantees at
//! most one such task exists until the fd is re-armed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::conn::Connection;
use crate::epoll::{
    Epoll, EventBuf, EDGE_TRIGGERED, ERROR, HANGUP, ONE_SHOT, PEER_CLOSED, READABLE, WRITABLE,
};
use crate::error::Result;
use crate::metrics::ServerMetrics;
use crate::sql::{Credentials, SqlPool};
use crate::syscalls;
use crate::timer::TimerHeap;
use crate::worker::WorkerPool;

const MAX_CLIENTS: usize = 1 << 16;
const MAX_EVENTS: usize = 4096;

/// Cloneable handle that asks a running server to shut down: sets the
/// closed flag and pokes the self-pipe so an indefinite wait returns.
#[derive(Clone)]
pub struct StopHandle {
    closed: Arc<AtomicBool>,
    wake_fd: RawFd,
}

impl StopHandle {
    pub fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = syscalls::write(self.wake_fd, b"s");
    }
}

pub struct Server {
    config: Config,
    timeout: Option<Duration>,
    listen_event: u32,
    conn_event: u32,
    listen_fd: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    epoll: Arc<Epoll>,
    events: EventBuf,
    timer: TimerHeap,
    workers: WorkerPool,
    users: HashMap<RawFd, Arc<Mutex<Connection>>>,
    src_dir: Arc<PathBuf>,
    credentials: Arc<dyn Credentials>,
    sql_pool: Option<Arc<SqlPool>>,
    metrics: Arc<ServerMetrics>,
    closed: Arc<AtomicBool>,
}

impl Server {
    /// Construct with a database-backed credential check. Socket or
    /// database failures here are fatal.
    pub fn new(config: Config) -> Result<Self> {
        let pool = Arc::new(SqlPool::connect(&config)?);
        Self::build(config, Arc::clone(&pool) as Arc<dyn Credentials>, Some(pool))
    }

    /// Construct with a caller-supplied credential check and no database.
    pub fn with_credentials(config: Config, credentials: Arc<dyn Credentials>) -> Result<Self> {
        Self::build(config, credentials, None)
    }

    fn build(
        config: Config,
        credentials: Arc<dyn Credentials>,
        sql_pool: Option<Arc<SqlPool>>,
    ) -> Result<Self> {
        config.validate()?;

        let (listen_event, conn_event) = event_mode(config.trig_mode);
        let src_dir = Arc::new(config.resolved_src_dir());
        let timeout = if config.timeout_ms > 0 {
            Some(Duration::from_millis(config.timeout_ms))
        } else {
            None
        };

        let listen_fd = syscalls::create_listen_socket(config.port, config.opt_linger)?;
        let setup = || -> io::Result<(Arc<Epoll>, RawFd, RawFd)> {
            let epoll = Arc::new(Epoll::new()?);
            epoll.add(listen_fd, listen_event | READABLE)?;
            syscalls::set_nonblocking(listen_fd)?;
            let (wake_r, wake_w) = syscalls::create_pipe()?;
            epoll.add(wake_r, READABLE)?;
            Ok((epoll, wake_r, wake_w))
        };
        let (epoll, wake_r, wake_w) = match setup() {
            Ok(v) => v,
            Err(err) => {
                syscalls::close_fd(listen_fd);
                return Err(err.into());
            }
        };

        info!(
            port = config.port,
            listen_mode = mode_name(listen_event),
            conn_mode = mode_name(conn_event),
            timeout_ms = config.timeout_ms,
            threads = config.thread_num,
            src_dir = %src_dir.display(),
            "server init"
        );

        Ok(Self {
            workers: WorkerPool::new(config.thread_num),
            config,
            timeout,
            listen_event,
            conn_event,
            listen_fd,
            wake_r,
            wake_w,
            epoll,
            events: EventBuf::new(MAX_EVENTS),
            timer: TimerHeap::new(),
            users: HashMap::new(),
            src_dir,
            credentials,
            sql_pool,
            metrics: Arc::new(ServerMetrics::new()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            closed: Arc::clone(&self.closed),
            wake_fd: self.wake_w,
        }
    }

    /// Drive the reactor until a `StopHandle` fires.
    pub fn run(&mut self) {
        info!("server start");
        while !self.closed.load(Ordering::Acquire) {
            let timeout_ms = match self.timeout {
                Some(_) => self.timer.next_tick_ms(),
                None => -1,
            };
            let n = match self.epoll.wait(&mut self.events, timeout_ms) {
                Ok(n) => n,
                Err(err) => {
                    error!(%err, "demultiplexer wait failed");
                    continue;
                }
            };
            for i in 0..n {
                let fd = self.events.fd(i);
                let mask = self.events.mask(i);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.wake_r {
                    self.drain_wake();
                } else if mask & (PEER_CLOSED | HANGUP | ERROR) != 0 {
                    self.close_conn(fd);
                } else if mask & READABLE != 0 {
                    self.extend_time(fd);
                    self.dispatch_read(fd);
                } else if mask & WRITABLE != 0 {
                    self.extend_time(fd);
                    self.dispatch_write(fd);
                } else {
                    error!(fd, mask, "unexpected event");
                }
            }
        }
        self.shutdown();
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => {
                    if self.metrics.active_conns() >= MAX_CLIENTS {
                        warn!(fd, "server busy, dropping client");
                        syscalls::close_fd(fd);
                    } else {
                        self.add_client(fd, addr);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
            if self.listen_event & EDGE_TRIGGERED == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Arc::new(Mutex::new(Connection::new(
            fd,
            addr,
            self.conn_event & EDGE_TRIGGERED != 0,
            Arc::clone(&self.src_dir),
            Arc::clone(&self.credentials),
            Arc::clone(&self.metrics),
        )));
        self.users.insert(fd, Arc::clone(&conn));

        if let Some(timeout) = self.timeout {
            let epoll = Arc::clone(&self.epoll);
            let timed_out = Arc::clone(&conn);
            self.timer.add(
                fd,
                timeout,
                Box::new(move || {
                    let mut c = lock_conn(&timed_out);
                    if !c.is_closed() {
                        info!(fd = c.fd(), "idle timeout");
                        close_connection(&epoll, &mut c);
                    }
                }),
            );
        }

        if let Err(err) = self.epoll.add(fd, READABLE | self.conn_event) {
            warn!(fd, %err, "failed to register client");
            lock_conn(&conn).close();
            self.users.remove(&fd);
            return;
        }
        let _ = syscalls::set_nonblocking(fd);
    }

    fn dispatch_read(&self, fd: RawFd) {
        if let Some(conn) = self.users.get(&fd) {
            let conn = Arc::clone(conn);
            let epoll = Arc::clone(&self.epoll);
            let conn_event = self.conn_event;
            self.workers
                .add_task(move || on_read(&conn, &epoll, conn_event));
        }
    }

    fn dispatch_write(&self, fd: RawFd) {
        if let Some(conn) = self.users.get(&fd) {
            let conn = Arc::clone(conn);
            let epoll = Arc::clone(&self.epoll);
            let conn_event = self.conn_event;
            self.workers
                .add_task(move || on_write(&conn, &epoll, conn_event));
        }
    }

    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    /// Reactor-side close for hangup/error events; the entry leaves the map
    /// here, worker-closed entries are replaced when the fd is reused.
    fn close_conn(&mut self, fd: RawFd) {
        if let Some(conn) = self.users.remove(&fd) {
            let mut c = lock_conn(&conn);
            if !c.is_closed() {
                close_connection(&self.epoll, &mut c);
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 16];
        let mut scratch = [0u8; 1];
        while matches!(syscalls::readv2(self.wake_r, &mut buf, &mut scratch), Ok(n) if n > 0) {}
    }

    fn shutdown(&mut self) {
        info!("server stopping");
        syscalls::close_fd(self.listen_fd);
        self.listen_fd = -1;

        for (_, conn) in self.users.drain() {
            let mut c = lock_conn(&conn);
            if !c.is_closed() {
                close_connection(&self.epoll, &mut c);
            }
        }
        self.timer.clear();

        if let Some(pool) = &self.sql_pool {
            pool.close_pool();
        }

        info!(
            requests = self.metrics.total_requests(),
            bytes_sent = self.metrics.bytes_sent(),
            "server stopped"
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.listen_fd >= 0 {
            syscalls::close_fd(self.listen_fd);
        }
        syscalls::close_fd(self.wake_r);
        syscalls::close_fd(self.wake_w);
    }
}

/// `1` flips connections to edge-triggered, `2` the listener, `3` both.
/// Connections always carry `PEER_CLOSED | ONE_SHOT`.
fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = PEER_CLOSED;
    let mut conn_event = PEER_CLOSED | ONE_SHOT;
    match trig_mode {
        1 => conn_event |= EDGE_TRIGGERED,
        2 => listen_event |= EDGE_TRIGGERED,
        3 => {
            listen_event |= EDGE_TRIGGERED;
            conn_event |= EDGE_TRIGGERED;
        }
        _ => {}
    }
    (listen_event, conn_event)
}

fn mode_name(event: u32) -> &'static str {
    if event & EDGE_TRIGGERED != 0 {
        "ET"
    } else {
        "LT"
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close_connection(epoll: &Epoll, conn: &mut Connection) {
    let _ = epoll.remove(conn.fd());
    conn.close();
}

/// Worker task for a readable fd: drain, then process.
fn on_read(conn: &Mutex<Connection>, epoll: &Epoll, conn_event: u32) {
    let mut c = lock_conn(conn);
    if c.is_closed() {
        return;
    }
    match c.read() {
        Ok(0) => {
            close_connection(epoll, &mut c);
            return;
        }
        Err(err) if err.kind() != io::ErrorKind::WouldBlock => {
            close_connection(epoll, &mut c);
            return;
        }
        _ => {}
    }
    on_process(epoll, conn_event, &mut c);
}

/// Worker task for a writable fd: flush, then keep alive or close.
fn on_write(conn: &Mutex<Connection>, epoll: &Epoll, conn_event: u32) {
    let mut c = lock_conn(conn);
    if c.is_closed() {
        return;
    }
    let res = c.write();
    if c.to_write_bytes() == 0 {
        if c.keep_alive() {
            on_process(epoll, conn_event, &mut c);
            return;
        }
    } else if let Err(err) = res {
        if err.kind() == io::ErrorKind::WouldBlock
            && epoll.modify(c.fd(), conn_event | WRITABLE).is_ok()
        {
            return;
        }
    }
    close_connection(epoll, &mut c);
}

/// Advance the connection state machine and re-arm the fd for the next
/// direction. Re-arming happens last, after the worker is done touching
/// the connection.
fn on_process(epoll: &Epoll, conn_event: u32, conn: &mut Connection) {
    let interest = if conn.handle() { WRITABLE } else { READABLE };
    if let Err(err) = epoll.modify(conn.fd(), conn_event | interest) {
        warn!(fd = conn.fd(), %err, "failed to re-arm connection");
        close_connection(epoll, conn);
    }
}
