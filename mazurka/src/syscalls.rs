//! Raw socket, vectored I/O and memory-mapping plumbing.
//!
//! Everything `unsafe` that talks to the kernel lives here so the rest of
//! the crate works with `io::Result` and never touches `libc` directly.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::{mem, ptr};

use libc::{c_int, c_void, socklen_t};

/// Create the listening TCP socket: optional `SO_LINGER(1, 1)`, then
/// `SO_REUSEADDR`, bind to `0.0.0.0:port`, listen with a backlog of 6.
///
/// The caller registers the fd with the demultiplexer and flips it
/// non-blocking afterwards.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let opt_linger = libc::linger {
            l_onoff: if linger { 1 } else { 0 },
            l_linger: if linger { 1 } else { 0 },
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt_linger as *const _ as *const c_void,
            mem::size_of_val(&opt_linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        // TCP_NODELAY is inherited by accepted sockets on Linux.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 6) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection. `Ok(None)` when the queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Scatter read into two regions with one syscall.
pub fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> io::Result<usize> {
    let iovecs = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut c_void,
            iov_len: second.len(),
        },
    ];

    let res = unsafe { libc::readv(fd, iovecs.as_ptr(), 2) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Gather write from up to two regions with one syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let count = bufs.len().min(2);
    for (i, buf) in bufs.iter().take(count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), count as c_int) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Map `len` bytes of an open file read-only and private.
///
/// Fails for `len == 0` (the kernel rejects zero-length mappings), which
/// the response builder turns into its inline error body.
pub fn mmap_readonly(fd: RawFd, len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

pub fn munmap(ptr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(ptr as *mut c_void, len);
    }
}

/// Non-blocking self-pipe, read end first. Used to wake the reactor out of
/// an indefinite `epoll_wait` on shutdown.
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Err(err) = set_nonblocking(fds[0]) {
        close_fd(fds[0]);
        close_fd(fds[1]);
        return Err(err);
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (r, w) = create_pipe().unwrap();
        assert_eq!(write(w, b"x").unwrap(), 1);
        let mut buf = [0u8; 8];
        let mut scratch = [0u8; 8];
        let n = readv2(r, &mut buf, &mut scratch).unwrap();
        assert_eq!(&buf[..n], b"x");
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn readv_reports_would_block() {
        let (r, w) = create_pipe().unwrap();
        let mut buf = [0u8; 8];
        let mut scratch = [0u8; 8];
        let err = readv2(r, &mut buf, &mut scratch).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        close_fd(r);
        close_fd(w);
    }
}
