//! Reply values returned by the server

use bytes::Bytes;
use std::fmt;

/// A decoded server reply
///
/// `MultiBulk` is recursive; a `None` payload on `Bulk` or `MultiBulk` is the
/// protocol's null (`$-1` / `*-1`), distinct from an empty string or list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string: `+OK`
    Status(String),
    /// Error status: `-ERR message`, kept verbatim
    Error(String),
    /// Integer: `:1000`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar`, or null
    Bulk(Option<Bytes>),
    /// Multi-bulk: `*2\r\n...`, or null
    MultiBulk(Option<Vec<Reply>>),
}

impl Reply {
    /// Build a non-null bulk reply
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(data.into()))
    }

    /// Build a non-null multi-bulk reply
    pub fn multi(items: Vec<Reply>) -> Self {
        Reply::MultiBulk(Some(items))
    }

    /// True for `$-1` and `*-1`
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::MultiBulk(None))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Status text of a `Status` reply
    pub fn as_status(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Raw text of an `Error` reply
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Reply::Error(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Payload of a non-null bulk reply
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Bulk or status payload as UTF-8 text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            Reply::Bulk(Some(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Elements of a non-null multi-bulk reply
    pub fn as_multi(&self) -> Option<&[Reply]> {
        match self {
            Reply::MultiBulk(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn into_multi(self) -> Option<Vec<Reply>> {
        match self {
            Reply::MultiBulk(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Reply::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Integer value of an integer reply or of a bulk holding decimal digits
    ///
    /// Introspection replies (e.g. ports) arrive in either form.
    pub fn to_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(Some(_)) | Reply::Status(_) => self.as_str()?.parse().ok(),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(None) | Reply::MultiBulk(None) => "null",
            Reply::Bulk(_) => "bulk",
            Reply::MultiBulk(_) => "multi-bulk",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(None) | Reply::MultiBulk(None) => write!(f, "(nil)"),
            Reply::Bulk(Some(data)) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::MultiBulk(Some(items)) => {
                if items.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}
