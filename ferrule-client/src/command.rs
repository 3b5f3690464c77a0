//! Command builder and request encoding
//!
//! A [`Command`] is an ordered list of binary-safe arguments. It is encoded as
//! a multi-bulk of bulk strings:
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<bytes>\r\n   (once per argument)
//! ```

use crate::slot::hash_slot;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Integers in `0..SMALL_INT_CACHE` are framed from a precomputed table
const SMALL_INT_CACHE: i64 = 1024;

static SMALL_INTS: LazyLock<Vec<Bytes>> = LazyLock::new(|| {
    (0..SMALL_INT_CACHE)
        .map(|n| {
            let mut digits = itoa::Buffer::new();
            let digits = digits.format(n);
            Bytes::from(format!("${}\r\n{}\r\n", digits.len(), digits))
        })
        .collect()
});

/// Commands that only read data; eligible for replica routing
const READ_ONLY_COMMANDS: &[&str] = &[
    "BITCOUNT",
    "BITPOS",
    "DBSIZE",
    "DUMP",
    "EXISTS",
    "GEODIST",
    "GEOHASH",
    "GEOPOS",
    "GEOSEARCH",
    "GET",
    "GETBIT",
    "GETRANGE",
    "HEXISTS",
    "HGET",
    "HGETALL",
    "HKEYS",
    "HLEN",
    "HMGET",
    "HSCAN",
    "HSTRLEN",
    "HVALS",
    "KEYS",
    "LINDEX",
    "LLEN",
    "LPOS",
    "LRANGE",
    "MGET",
    "PFCOUNT",
    "PTTL",
    "RANDOMKEY",
    "SCAN",
    "SCARD",
    "SDIFF",
    "SINTER",
    "SISMEMBER",
    "SMEMBERS",
    "SMISMEMBER",
    "SRANDMEMBER",
    "SSCAN",
    "STRLEN",
    "SUNION",
    "TTL",
    "TYPE",
    "XLEN",
    "XRANGE",
    "XREVRANGE",
    "ZCARD",
    "ZCOUNT",
    "ZLEXCOUNT",
    "ZMSCORE",
    "ZRANGE",
    "ZRANGEBYLEX",
    "ZRANGEBYSCORE",
    "ZRANK",
    "ZREVRANGE",
    "ZREVRANGEBYSCORE",
    "ZREVRANK",
    "ZSCAN",
    "ZSCORE",
];

fn is_read_only_command(name: &str) -> bool {
    READ_ONLY_COMMANDS
        .binary_search(&name.to_ascii_uppercase().as_str())
        .is_ok()
}

/// How a null argument is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullEncoding {
    /// `$0\r\n\r\n`: an empty string, the only form servers accept in requests
    #[default]
    EmptyBulk,
    /// `$-1\r\n`: the protocol's null bulk string
    NullBulk,
}

/// A single command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Bytes(Bytes),
    Int(i64),
    Null,
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Bytes(Bytes::from(s))
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::from(s.as_str())
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(b: &[u8; N]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg::Bytes(b)
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Int(n)
    }
}

impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Arg::Int(i64::from(n))
    }
}

impl From<u32> for Arg {
    fn from(n: u32) -> Self {
        Arg::Int(i64::from(n))
    }
}

impl From<u16> for Arg {
    fn from(n: u16) -> Self {
        Arg::Int(i64::from(n))
    }
}

impl From<u64> for Arg {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => Arg::Int(n),
            Err(_) => Arg::Bytes(Bytes::from(n.to_string())),
        }
    }
}

impl From<usize> for Arg {
    fn from(n: usize) -> Self {
        Arg::from(n as u64)
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Arg::Bytes(Bytes::from(n.to_string()))
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Null, Into::into)
    }
}

/// A command ready to be sent
///
/// # Example
/// ```
/// use ferrule_client::Command;
///
/// let cmd = Command::new("SET").key("foo").arg("bar");
/// assert_eq!(&cmd.encode()[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
/// assert_eq!(cmd.slot(), Some(12182));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Arg>,
    name_len: usize,
    slot: Option<u16>,
    read_only: bool,
}

impl Command {
    /// Start a command; whitespace separated tokens become separate arguments
    /// (`"CLUSTER SLOTS"` is two arguments)
    pub fn new(name: &str) -> Self {
        let args: Vec<Arg> = name.split_ascii_whitespace().map(Arg::from).collect();
        let read_only = args.len() == 1 && is_read_only_command(name.trim());
        Self {
            name_len: args.len(),
            args,
            slot: None,
            read_only,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a variadic list: its length as one argument, then each element
    pub fn arg_list<I, A>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let items: Vec<Arg> = items.into_iter().map(Into::into).collect();
        self.args.push(Arg::from(items.len()));
        self.args.extend(items);
        self
    }

    /// Append the routing key and compute its slot
    ///
    /// Only the first key marks the slot; later keys are plain arguments.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        let key = key.as_ref();
        if self.slot.is_none() {
            self.slot = Some(hash_slot(key));
        }
        self.args.push(Arg::from(key));
        self
    }

    /// Override the read-only flag used for replica selection
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Command name tokens joined by a space
    pub fn name(&self) -> String {
        self.args[..self.name_len]
            .iter()
            .map(|arg| match arg {
                Arg::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                Arg::Int(n) => n.to_string(),
                Arg::Null => String::new(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Every argument, name tokens included
    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Slot of the routing key, `None` for key-less commands
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Encode with the default null framing
    pub fn encode(&self) -> Bytes {
        self.encode_with(NullEncoding::default())
    }

    /// Encode to wire bytes
    pub fn encode_with(&self, null: NullEncoding) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        let mut count = itoa::Buffer::new();
        buf.put_u8(b'*');
        buf.put_slice(count.format(self.args.len()).as_bytes());
        buf.put_slice(b"\r\n");

        for arg in &self.args {
            match arg {
                Arg::Bytes(data) => put_bulk(&mut buf, data),
                Arg::Int(n) if (0..SMALL_INT_CACHE).contains(n) => {
                    buf.put_slice(&SMALL_INTS[*n as usize]);
                }
                Arg::Int(n) => {
                    let mut digits = itoa::Buffer::new();
                    put_bulk(&mut buf, digits.format(*n).as_bytes());
                }
                Arg::Null => match null {
                    NullEncoding::EmptyBulk => buf.put_slice(b"$0\r\n\r\n"),
                    NullEncoding::NullBulk => buf.put_slice(b"$-1\r\n"),
                },
            }
        }

        buf.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        16 + self
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Bytes(data) => data.len() + 16,
                Arg::Int(_) => 28,
                Arg::Null => 6,
            })
            .sum::<usize>()
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    let mut len = itoa::Buffer::new();
    buf.put_u8(b'$');
    buf.put_slice(len.format(data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}
