//! Incremental RESP reply decoder.
//!
//! The decoder is a pure function over a byte slice: it either yields one
//! complete reply plus the number of bytes it consumed, reports that the
//! input is incomplete, or fails with a protocol error. Connection code
//! owns the buffering; the decoder never reads from a socket.

use bytes::Bytes;

use crate::error::{RespError, Result};
use crate::reply::Reply;

/// Decode one reply from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a full reply, and
/// `Ok(Some((reply, consumed)))` once it does.
///
/// # Errors
///
/// [`RespError::Protocol`] on a malformed type byte, length or integer.
pub fn decode(src: &[u8]) -> Result<Option<(Reply, usize)>> {
    let mut pos = 0;
    match parse(src, &mut pos, 0) {
        Ok(reply) => Ok(Some((reply, pos))),
        Err(Partial::Incomplete) => Ok(None),
        Err(Partial::Bad(e)) => Err(e),
    }
}

/// Nesting bound for array replies. Anything deeper is hostile input,
/// not a protocol the server speaks.
const MAX_DEPTH: usize = 64;

enum Partial {
    Incomplete,
    Bad(RespError),
}

impl From<RespError> for Partial {
    fn from(e: RespError) -> Self {
        Self::Bad(e)
    }
}

fn parse(src: &[u8], pos: &mut usize, depth: usize) -> std::result::Result<Reply, Partial> {
    if depth > MAX_DEPTH {
        return Err(bad(format!("reply nesting exceeds {MAX_DEPTH} levels")));
    }
    let marker = get_u8(src, pos)?;
    match marker {
        b'+' => Ok(Reply::Status(copy_line(src, pos)?)),
        b'-' => Ok(Reply::Error(copy_line(src, pos)?)),
        b':' => Ok(Reply::Integer(get_int(src, pos)?)),
        b'$' => match get_int(src, pos)? {
            -1 => Ok(Reply::Nil),
            len if len < 0 => Err(bad(format!("negative bulk length {len}"))),
            len => {
                let len = len as usize;
                if src.len() - *pos < len + 2 {
                    return Err(Partial::Incomplete);
                }
                let payload = Bytes::copy_from_slice(&src[*pos..*pos + len]);
                if &src[*pos + len..*pos + len + 2] != b"\r\n" {
                    return Err(bad("bulk string not CRLF terminated".to_string()));
                }
                *pos += len + 2;
                Ok(Reply::Bulk(payload))
            }
        },
        b'*' => match get_int(src, pos)? {
            -1 => Ok(Reply::Nil),
            len if len < 0 => Err(bad(format!("negative array length {len}"))),
            len => {
                // The element count is untrusted wire data: cap the
                // pre-reservation so a lying header cannot force a huge
                // allocation before the first element even parses.
                let mut items = Vec::with_capacity((len as usize).min(src.len() - *pos));
                for _ in 0..len {
                    items.push(parse(src, pos, depth + 1)?);
                }
                Ok(Reply::Array(items))
            }
        },
        other => Err(bad(format!("invalid reply type byte 0x{other:02x}"))),
    }
}

fn bad(msg: String) -> Partial {
    Partial::Bad(RespError::Protocol(msg))
}

fn get_u8(src: &[u8], pos: &mut usize) -> std::result::Result<u8, Partial> {
    let b = *src.get(*pos).ok_or(Partial::Incomplete)?;
    *pos += 1;
    Ok(b)
}

/// Slice out the line payload up to the next CRLF, advancing past it.
fn get_line<'a>(src: &'a [u8], pos: &mut usize) -> std::result::Result<&'a [u8], Partial> {
    let rest = &src[*pos..];
    let Some(nl) = rest.windows(2).position(|w| w == b"\r\n") else {
        return Err(Partial::Incomplete);
    };
    let line = &rest[..nl];
    *pos += nl + 2;
    Ok(line)
}

fn copy_line(src: &[u8], pos: &mut usize) -> std::result::Result<Bytes, Partial> {
    Ok(Bytes::copy_from_slice(get_line(src, pos)?))
}

fn get_int(src: &[u8], pos: &mut usize) -> std::result::Result<i64, Partial> {
    let line = get_line(src, pos)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| bad(format!("invalid integer line {:?}", String::from_utf8_lossy(line))))
}
