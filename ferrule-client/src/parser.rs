//! Incremental RESP2 reply decoder
//!
//! Feeds on the connection's read buffer and yields one [`Reply`] at a time.
//! Scalars are consumed only once complete. Multi-bulk elements are consumed
//! as they arrive and held on a stack of open frames, so a large reply split
//! across many socket reads is walked once.

use crate::error::{Error, Result};
use crate::reply::Reply;
use bytes::{Buf, BytesMut};

/// Largest bulk payload accepted (512 MiB, the server's own limit)
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest multi-bulk nesting accepted
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Upper bound on preallocated multi-bulk capacity
const PREALLOC_LIMIT: usize = 1024;

/// A multi-bulk whose elements are still arriving
#[derive(Debug, Clone)]
struct Frame {
    remaining: usize,
    items: Vec<Reply>,
}

/// Outcome of taking one item off the buffer
enum Step {
    Incomplete,
    Opened,
    Value(Reply),
}

/// RESP2 reply decoder
#[derive(Debug, Clone)]
pub struct ReplyParser {
    max_bulk_len: usize,
    max_depth: usize,
    stack: Vec<Frame>,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
            stack: Vec::new(),
        }
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest accepted bulk payload
    pub fn with_max_bulk_len(mut self, len: usize) -> Self {
        self.max_bulk_len = len;
        self
    }

    /// Set the deepest accepted multi-bulk nesting
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// True while a multi-bulk reply is partially decoded
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Decode one reply from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold the rest of a reply.
    /// Elements of an unfinished multi-bulk are taken out of `buf` and kept
    /// until the next call. After an error the parser starts afresh.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>> {
        let result = self.step(buf);
        if result.is_err() {
            self.stack.clear();
        }
        result
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>> {
        loop {
            match self.next_value(buf)? {
                Step::Incomplete => return Ok(None),
                Step::Opened => {}
                Step::Value(value) => {
                    if let Some(reply) = self.complete(value) {
                        return Ok(Some(reply));
                    }
                }
            }
        }
    }

    /// Take one value or multi-bulk header off `buf`
    fn next_value(&mut self, buf: &mut BytesMut) -> Result<Step> {
        let Some((line, header_len)) = read_line(&buf[..])? else {
            return Ok(Step::Incomplete);
        };
        let Some(&prefix) = line.first() else {
            return Err(Error::Protocol("empty reply line".to_string()));
        };

        let body = &line[1..];
        let value = match prefix {
            b'+' => Reply::Status(text(body)),
            b'-' => Reply::Error(text(body)),
            b':' => Reply::Integer(parse_int(body)?),
            b'$' => {
                let len = parse_int(body)?;
                return self.take_bulk(buf, len, header_len);
            }
            b'*' => {
                let count = parse_int(body)?;
                buf.advance(header_len);
                return self.open_multi(count);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "invalid reply prefix: {:#04x}",
                    other
                )));
            }
        };
        buf.advance(header_len);
        Ok(Step::Value(value))
    }

    fn take_bulk(&self, buf: &mut BytesMut, len: i64, header_len: usize) -> Result<Step> {
        if len == -1 {
            buf.advance(header_len);
            return Ok(Step::Value(Reply::Bulk(None)));
        }
        if len < 0 {
            return Err(Error::Protocol(format!("invalid bulk length: {}", len)));
        }

        let len = len as usize;
        if len > self.max_bulk_len {
            return Err(Error::Protocol(format!(
                "bulk length {} exceeds {} byte limit",
                len, self.max_bulk_len
            )));
        }

        let end = header_len + len;
        if buf.len() < end + 2 {
            return Ok(Step::Incomplete);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(Error::Protocol("bulk payload missing CRLF".to_string()));
        }

        buf.advance(header_len);
        let payload = buf.split_to(len).freeze();
        buf.advance(2);
        Ok(Step::Value(Reply::Bulk(Some(payload))))
    }

    /// A non-empty multi-bulk opens a frame; its elements follow
    fn open_multi(&mut self, count: i64) -> Result<Step> {
        if count == -1 {
            return Ok(Step::Value(Reply::MultiBulk(None)));
        }
        if count < 0 {
            return Err(Error::Protocol(format!("invalid multi-bulk size: {}", count)));
        }
        if self.stack.len() >= self.max_depth {
            return Err(Error::Protocol(format!(
                "multi-bulk nesting exceeds depth {}",
                self.max_depth
            )));
        }
        if count == 0 {
            return Ok(Step::Value(Reply::multi(Vec::new())));
        }

        let count = count as usize;
        self.stack.push(Frame {
            remaining: count,
            items: Vec::with_capacity(count.min(PREALLOC_LIMIT)),
        });
        Ok(Step::Opened)
    }

    /// Fold a finished value into the open frames; returns the top-level
    /// reply once the outermost frame closes.
    fn complete(&mut self, mut value: Reply) -> Option<Reply> {
        while let Some(frame) = self.stack.last_mut() {
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return None;
            }
            let items = self.stack.pop().map(|frame| frame.items).unwrap_or_default();
            value = Reply::MultiBulk(Some(items));
        }
        Some(value)
    }
}

/// Split off one CRLF-terminated line; returns the line without CRLF and the
/// number of bytes it occupies including CRLF.
fn read_line(data: &[u8]) -> Result<Option<(&[u8], usize)>> {
    match memchr::memchr(b'\n', data) {
        Some(nl) if nl > 0 && data[nl - 1] == b'\r' => Ok(Some((&data[..nl - 1], nl + 1))),
        Some(_) => Err(Error::Protocol("line not terminated by CRLF".to_string())),
        None => Ok(None),
    }
}

fn parse_int(field: &[u8]) -> Result<i64> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(field)
            ))
        })
}

fn text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}
