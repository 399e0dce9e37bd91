//! Outbound commands.

use bytes::{Bytes, BytesMut};

use super::encode::{encode_command, header_len};

/// Commands that never modify data and may be served by a replica.
const READ_ONLY_COMMANDS: &[&str] = &[
    "BITCOUNT", "BITPOS", "DBSIZE", "ECHO", "EXISTS", "GEODIST", "GEOHASH", "GEOPOS",
    "GEOSEARCH", "GET", "GETBIT", "GETRANGE", "HEXISTS", "HGET", "HGETALL", "HKEYS", "HLEN",
    "HMGET", "HSCAN", "HSTRLEN", "HVALS", "KEYS", "LINDEX", "LLEN", "LPOS", "LRANGE", "MGET",
    "PFCOUNT", "PING", "PTTL", "RANDOMKEY", "SCAN", "SCARD", "SDIFF", "SINTER", "SISMEMBER",
    "SMEMBERS", "SMISMEMBER", "SRANDMEMBER", "SSCAN", "STRLEN", "SUNION", "TTL", "TYPE",
    "XLEN", "XRANGE", "XREVRANGE", "ZCARD", "ZCOUNT", "ZLEXCOUNT", "ZMSCORE", "ZRANGE",
    "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREVRANGE", "ZREVRANK", "ZSCAN", "ZSCORE",
];

/// A command name and its binary-safe arguments.
///
/// # Examples
///
/// ```
/// use respmux::resp::Command;
///
/// let cmd = Command::new("SET").key("greeting").arg("hello");
/// assert_eq!(cmd.routing_key(), Some(&b"greeting"[..]));
/// assert!(!cmd.is_read_only());
/// assert_eq!(
///     &cmd.encode()[..],
///     b"*3\r\n$3\r\nSET\r\n$8\r\ngreeting\r\n$5\r\nhello\r\n"
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
    key_index: Option<usize>,
    read_only: Option<bool>,
}

impl Command {
    /// Start a command with the given name.
    #[must_use]
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
            key_index: None,
            read_only: None,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an argument without copying it.
    #[must_use]
    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.args.push(arg);
        self
    }

    /// Append an argument and use it for routing.
    ///
    /// Only the first key marked this way is considered.
    #[must_use]
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        if self.key_index.is_none() {
            self.key_index = Some(self.args.len());
        }
        self.arg(key)
    }

    /// Override the read-only classification derived from the command name.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// The command name as supplied.
    #[must_use]
    pub fn name(&self) -> &[u8] { self.args.first().map_or(&[][..], |name| &name[..]) }

    /// All arguments including the command name.
    #[must_use]
    pub fn args(&self) -> &[Bytes] { &self.args }

    /// The key used for routing, if one was marked.
    #[must_use]
    pub fn routing_key(&self) -> Option<&[u8]> {
        self.key_index
            .and_then(|index| self.args.get(index))
            .map(|key| &key[..])
    }

    /// Whether the command may be served by a replica.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or_else(|| {
            READ_ONLY_COMMANDS
                .iter()
                .any(|known| known.as_bytes().eq_ignore_ascii_case(self.name()))
        })
    }

    /// Returns `true` when the command name matches `name`, ignoring case.
    #[must_use]
    pub fn is(&self, name: &str) -> bool { self.name().eq_ignore_ascii_case(name.as_bytes()) }

    /// Number of bytes [`Command::encode`] produces.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.args.iter().fold(header_len(self.args.len()), |total, arg| {
            total + header_len(arg.len()) + arg.len() + 2
        })
    }

    /// Encode the command into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        encode_command(self, &mut dst);
        dst.freeze()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name().escape_ascii())
    }
}
