//! Growable byte buffer with separate read and write cursors.
//!
//! Invariant: `read_pos <= write_pos <= data.len()`.

use std::io;
use std::os::unix::io::RawFd;

use crate::syscalls;

/// Stack scratch used as the second `readv` region; a burst larger than the
/// buffer tail lands here and is appended afterwards, so a large inbound
/// request grows the buffer once instead of per-read.
const SCRATCH_LEN: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read: `write_pos - read_pos`.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes writable at the tail without growing.
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Bytes already consumed at the front (reclaimable by compaction).
    pub fn consumed(&self) -> usize {
        self.read_pos
    }

    /// Zero the storage and reset both cursors.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// The readable window `[read_pos, write_pos)`.
    pub fn as_read_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `len` bytes.
    pub fn advance(&mut self, len: usize) {
        debug_assert!(len <= self.readable());
        self.read_pos += len.min(self.readable());
    }

    /// Extract the readable window as a string and reset the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let out = String::from_utf8_lossy(self.as_read_slice()).into_owned();
        self.clear();
        out
    }

    /// Guarantee at least `len` writable bytes, compacting when the
    /// consumed prefix plus the tail already covers it, growing otherwise.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.alloc_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Vectored read from `fd` into (tail, 64 KiB scratch). Overflow into
    /// the scratch region is appended, growing the buffer as needed.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let writable = self.writable();
        let tail_start = self.write_pos;

        let n = syscalls::readv2(fd, &mut self.data[tail_start..], &mut scratch)?;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Single `write` of the readable window; advances the read cursor by
    /// the number of bytes accepted by the kernel.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write(fd, self.as_read_slice())?;
        self.read_pos += n;
        Ok(n)
    }

    fn alloc_space(&mut self, len: usize) {
        if self.writable() + self.consumed() < len {
            self.data.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
