//! Ergonomic command builder and RESP request encoding.
//!
//! A command is a flat list of argument frames encoded as a RESP
//! multi-bulk (`*N\r\n$len\r\narg\r\n...`). The builder provides a fluent
//! API with automatic conversions from common argument types.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RespError, Result};

/// Builder for a single RESP command.
///
/// # Examples
///
/// ```
/// use heliograph_resp::Command;
///
/// let frame = Command::new("SET").arg("color").arg("teal").into_bytes().unwrap();
/// assert_eq!(&frame[..], b"*3\r\n$3\r\nSET\r\n$5\r\ncolor\r\n$4\r\nteal\r\n");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command from its name (`SET`, `GET`, `SUBSCRIBE`, ...).
    #[must_use]
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Build a command from an argument vector, name first.
    ///
    /// # Examples
    ///
    /// ```
    /// use heliograph_resp::Command;
    ///
    /// let cmd = Command::from_args(["LPUSH", "jobs", "j-1"]);
    /// ```
    #[must_use]
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            args: args
                .into_iter()
                .map(|a| Bytes::copy_from_slice(a.as_ref()))
                .collect(),
        }
    }

    /// Append one argument frame.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an integer argument in its decimal form.
    #[must_use]
    pub fn arg_int(mut self, arg: i64) -> Self {
        self.args.push(Bytes::from(arg.to_string()));
        self
    }

    /// Number of argument frames accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True when no argument has been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Encode into an owned wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`RespError::InvalidCommand`] for a command with no
    /// arguments at all. Encoding performs no I/O.
    pub fn into_bytes(self) -> Result<Bytes> {
        if self.args.is_empty() {
            return Err(RespError::InvalidCommand("empty command"));
        }

        let payload: usize = self.args.iter().map(|a| a.len() + 16).sum();
        let mut out = BytesMut::with_capacity(payload + 16);

        put_header(&mut out, b'*', self.args.len());
        for arg in &self.args {
            put_header(&mut out, b'$', arg.len());
            out.put_slice(arg);
            out.put_slice(b"\r\n");
        }

        Ok(out.freeze())
    }
}

fn put_header(out: &mut BytesMut, marker: u8, n: usize) {
    out.put_u8(marker);
    out.put_slice(n.to_string().as_bytes());
    out.put_slice(b"\r\n");
}
