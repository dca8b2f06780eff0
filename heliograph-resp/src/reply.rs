//! The RESP reply algebra.

use std::fmt;

use bytes::Bytes;

/// A single decoded reply from a RESP server.
///
/// Replies form a small algebra: scalars (`Nil`, `Integer`, `Bulk`,
/// `Status`, `Error`) and arrays of nested replies. Bulk payloads are
/// refcounted `Bytes`, so cloning a reply never copies the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Null bulk string or null array (`$-1` / `*-1`)
    Nil,
    /// `:` integer line
    Integer(i64),
    /// `$` bulk string
    Bulk(Bytes),
    /// `+` status line
    Status(Bytes),
    /// `-` error line
    Error(Bytes),
    /// `*` array of nested replies
    Array(Vec<Reply>),
}

impl Reply {
    /// True for the canonical `+OK` status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s.as_ref() == b"OK")
    }

    /// True for a server-side `-` error reply.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Payload of a bulk, status or error reply.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) | Reply::Status(b) | Reply::Error(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    /// Value of an integer reply.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn dump(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = (depth + 1) * 2;
        match self {
            Reply::Nil => writeln!(f, "{:indent$}Nil", ""),
            Reply::Integer(i) => writeln!(f, "{:indent$}Integer : {i}", ""),
            Reply::Bulk(b) => {
                writeln!(f, "{:indent$}String : \"{}\"", "", String::from_utf8_lossy(b))
            }
            Reply::Status(s) => {
                writeln!(f, "{:indent$}Status : {}", "", String::from_utf8_lossy(s))
            }
            Reply::Error(e) => {
                writeln!(f, "{:indent$}Error  : {}", "", String::from_utf8_lossy(e))
            }
            Reply::Array(items) => {
                writeln!(f, "{:indent$}Array  : {}", "", items.len())?;
                for item in items {
                    item.dump(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// Indented multi-line dump, one node per line. Handy for debugging
/// pipelined and pub/sub traffic.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f, 0)
    }
}
