//! Per-client connection: one socket, two buffers, request, response.
//!
//! A connection is only ever driven by the single worker task the reactor
//! dispatched for it (one-shot readiness guarantees no second task runs
//! until the fd is re-armed), so no locking happens here.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::buffer::Buffer;
use crate::metrics::ServerMetrics;
use crate::request::{ParseError, Request};
use crate::response::Response;
use crate::sql::Credentials;
use crate::syscalls;

/// Below this many pending bytes a level-triggered writer yields back to
/// the reactor instead of monopolising the worker.
const WRITE_BATCH_FLOOR: usize = 10240;

pub struct Connection {
    fd: RawFd,
    addr: SocketAddr,
    closed: bool,
    is_et: bool,
    src_dir: Arc<PathBuf>,
    credentials: Arc<dyn Credentials>,
    metrics: Arc<ServerMetrics>,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mapped file already pushed to the socket.
    file_written: usize,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        addr: SocketAddr,
        is_et: bool,
        src_dir: Arc<PathBuf>,
        credentials: Arc<dyn Credentials>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let active = metrics.conn_opened();
        info!(fd, peer = %addr, active, "client in");
        Self {
            fd,
            addr,
            closed: false,
            is_et,
            src_dir,
            credentials,
            metrics,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: Request::new(),
            response: Response::new(),
            file_written: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + (self.response.file_len() - self.file_written)
    }

    /// Drain the socket into the input buffer. In edge-triggered mode keep
    /// reading until the kernel reports would-block.
    ///
    /// `Ok(0)` is end of stream; `Err(WouldBlock)` with nothing read is an
    /// empty wakeup. Both are the caller's signal to close or re-arm.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.is_et {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(err);
                    }
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Gather-write the header buffer and the mapped file body. Loops while
    /// edge-triggered or while a large response would otherwise starve
    /// other connections.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let header_len = self.write_buf.readable();
            let n = {
                let header = self.write_buf.as_read_slice();
                let file = self
                    .response
                    .file()
                    .map(|f| &f.as_slice()[self.file_written..])
                    .unwrap_or(&[]);
                syscalls::writev(self.fd, &[header, file])?
            };
            if n == 0 {
                break;
            }
            total += n;
            self.metrics.add_bytes_sent(n);

            if n > header_len {
                self.file_written += n - header_len;
                if header_len > 0 {
                    // Header fully flushed; its bytes are gone.
                    self.write_buf.clear();
                }
            } else {
                self.write_buf.advance(n);
            }

            if !(self.is_et || self.to_write_bytes() > WRITE_BATCH_FLOOR) {
                break;
            }
        }
        Ok(total)
    }

    /// Parse whatever is buffered and build the response. Returns true when
    /// a response is ready to write; false when more input is needed.
    pub fn handle(&mut self) -> bool {
        self.request.clear();
        if self.read_buf.readable() == 0 {
            return false;
        }

        match self.request.parse(&mut self.read_buf, self.credentials.as_ref()) {
            Ok(()) => {
                self.metrics.request_served();
                self.response.init(
                    &self.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    200,
                );
            }
            Err(ParseError::Incomplete) => return false,
            Err(ParseError::BadRequest) => {
                self.response
                    .init(&self.src_dir, self.request.path(), false, 400);
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.file_written = 0;
        true
    }

    /// Idempotent: releases the file mapping, closes the fd, drops the
    /// connection out of the user count.
    pub fn close(&mut self) {
        self.response.unmap_file();
        if !self.closed {
            self.closed = true;
            let fd = self.fd;
            self.fd = -1;
            syscalls::close_fd(fd);
            let active = self.metrics.conn_closed();
            info!(fd, peer = %self.addr, active, "client out");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
