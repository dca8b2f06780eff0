//! Blocking RESP connection.
//!
//! One connection wraps one `std::net` stream (TCP or Unix socket) and
//! exposes the pipelined request/reply primitives the engine's readers
//! build on: append preformatted commands without I/O, then flush and
//! block-read replies one at a time.

use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::codec::decode;
use crate::error::{RespError, Result};
use crate::reply::Reply;

/// Default ceiling for the idle read buffer, matching the common RESP
/// client default of 16 MiB. Once the buffer is empty, capacity beyond
/// the ceiling is shed back to `READ_CHUNK`.
pub const DEFAULT_MAX_BUF: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write_all(buf),
        }
    }
}

/// A blocking connection to one RESP backend.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    max_buf: usize,
}

impl Connection {
    /// Open a TCP connection. Name resolution follows `ToSocketAddrs`.
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        debug!(host, port, "resp connection open");
        Ok(Self::from_stream(Stream::Tcp(stream)))
    }

    /// Open a Unix-domain socket connection.
    #[cfg(unix)]
    pub fn connect_unix(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!(path = %path.display(), "resp connection open");
        Ok(Self::from_stream(Stream::Unix(stream)))
    }

    fn from_stream(stream: Stream) -> Self {
        Self {
            stream,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::new(),
            max_buf: DEFAULT_MAX_BUF,
        }
    }

    /// Enable TCP keep-alive with a 15 s idle probe. No-op for Unix
    /// sockets.
    pub fn enable_keepalive(&self) -> std::io::Result<()> {
        match &self.stream {
            Stream::Tcp(s) => {
                let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(15));
                socket2::SockRef::from(s).set_tcp_keepalive(&keepalive)
            }
            #[cfg(unix)]
            Stream::Unix(_) => Ok(()),
        }
    }

    /// Apply a read/write timeout to blocking operations. `None` blocks
    /// indefinitely. No-op for Unix sockets.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match &self.stream {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Stream::Unix(_) => Ok(()),
        }
    }

    /// Override the idle read-buffer ceiling.
    pub fn set_max_buf(&mut self, max_buf: usize) {
        self.max_buf = max_buf;
    }

    /// Queue a preformatted command frame. No I/O happens until the next
    /// [`read_reply`](Self::read_reply).
    pub fn append(&mut self, frame: &Bytes) {
        self.wbuf.extend_from_slice(frame);
    }

    /// Flush queued commands and block until one full reply arrives.
    ///
    /// # Errors
    ///
    /// [`RespError::Eof`] when the peer closes the stream,
    /// [`RespError::Io`] on transport failures (including timeouts), and
    /// [`RespError::Protocol`] on malformed data.
    pub fn read_reply(&mut self) -> Result<Reply> {
        self.flush()?;

        loop {
            if let Some((reply, used)) = decode(&self.rbuf)? {
                self.rbuf.advance(used);
                self.shed();
                return Ok(reply);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(RespError::Eof);
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.wbuf.is_empty() {
            self.stream.write_all(&self.wbuf)?;
            self.wbuf.clear();
        }
        Ok(())
    }

    /// Shed an oversized idle buffer so one huge reply does not pin its
    /// capacity for the lifetime of the connection.
    fn shed(&mut self) {
        if self.rbuf.is_empty() && self.rbuf.capacity() > self.max_buf {
            self.rbuf = BytesMut::with_capacity(READ_CHUNK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot backend: waits for any request bytes, answers with a
    /// fixed script, then optionally hangs up.
    fn scripted_backend(script: &'static [u8], close_after: bool) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream.write_all(script).unwrap();
            if !close_after {
                // Keep the connection parked until the client goes away.
                let _ = stream.read(&mut buf);
            }
        });
        ("127.0.0.1".to_string(), port)
    }

    #[test]
    fn append_then_read_pipelined_replies() {
        let (host, port) = scripted_backend(b"+first\r\n+second\r\n", false);
        let mut conn = Connection::connect_tcp(&host, port).unwrap();

        conn.append(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
        conn.append(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));

        assert_eq!(
            conn.read_reply().unwrap(),
            Reply::Status(Bytes::from_static(b"first"))
        );
        assert_eq!(
            conn.read_reply().unwrap(),
            Reply::Status(Bytes::from_static(b"second"))
        );
    }

    #[test]
    fn peer_close_is_eof() {
        let (host, port) = scripted_backend(b"+only\r\n", true);
        let mut conn = Connection::connect_tcp(&host, port).unwrap();

        conn.append(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
        conn.read_reply().unwrap();

        let err = conn.read_reply().unwrap_err();
        assert!(matches!(err, RespError::Eof));
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_surfaces_as_retryable_io() {
        let (host, port) = scripted_backend(b"", false);
        let mut conn = Connection::connect_tcp(&host, port).unwrap();
        conn.set_timeout(Some(Duration::from_millis(50))).unwrap();

        conn.append(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
        let err = conn.read_reply().unwrap_err();
        assert!(err.is_retryable(), "timeout should be retryable: {err}");
    }

    #[test]
    fn connect_refused_is_io() {
        let port = portpicker::pick_unused_port().expect("free port");
        let err = Connection::connect_tcp("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, RespError::Io(_)));
    }
}
