//! TCP socket configuration for writer connections.
//!
//! # Safety
//!
//! This module uses unsafe code to access raw file descriptors/sockets
//! for TCP socket configuration. The unsafe operations are encapsulated
//! and safe to use from the rest of the crate.

#![allow(unsafe_code)]

use std::io;
use std::time::Duration;

/// Enable TCP keep-alive (15 s idle probe) on a compio `TcpStream`.
///
/// Mirrored writer connections sit idle between bursts; keep-alive is
/// what eventually surfaces a silently dead backend to the event loop.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub(crate) fn enable_tcp_keepalive(stream: &compio::net::TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(15));

    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let res = sock.set_tcp_keepalive(&keepalive);
        std::mem::forget(sock); // Don't close the fd
        res
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let res = sock.set_tcp_keepalive(&keepalive);
        std::mem::forget(sock); // Don't close the socket
        res
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, keepalive);
        Ok(())
    }
}
