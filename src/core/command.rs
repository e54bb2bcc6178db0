use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;
use bytes::Bytes;

/// A command ready to be sent to Redis.
///
/// Besides its arguments a command remembers which of them are keys, so the
/// cluster layer can derive a hash slot, and may carry an explicit slot for
/// keyless commands that must still be routed to a particular shard.
///
/// # Example
///
/// ```
/// use routis::core::command::{Cmd, get, set};
///
/// let cmd = Cmd::new("SET").key("key").arg("value");
/// let get_cmd = get("key");
/// let set_cmd = set("key", "new_value");
/// assert_eq!(cmd.name(), "SET");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
    key_indices: Vec<usize>,
    slot: Option<u16>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            key_indices: Vec::new(),
            slot: None,
        }
    }

    /// Appends an argument to the command.
    ///
    /// # Arguments
    ///
    /// * `arg` - The argument value
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a key argument. Keys decide the command's cluster slot.
    #[inline]
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key_indices.push(self.args.len());
        self.args.push(key.into());
        self
    }

    /// Pins the command to a hash slot regardless of its keys.
    #[inline]
    pub fn with_slot(mut self, slot: u16) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Returns the explicitly pinned slot, if any.
    pub fn pinned_slot(&self) -> Option<u16> {
        self.slot
    }

    /// Returns the upper-cased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Returns all arguments, name first.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Iterates over the key arguments.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.key_indices.iter().map(move |&i| self.args[i].as_ref())
    }

    /// Returns true if the command carries no key and no pinned slot.
    pub fn is_keyless(&self) -> bool {
        self.key_indices.is_empty() && self.slot.is_none()
    }

    /// Builds the RESP array frame for this command without consuming it.
    ///
    /// Executors replay the same command across attempts, so this clones the
    /// (reference-counted) argument buffers rather than the data.
    pub fn to_frame(&self) -> Frame {
        Frame::Array(
            self.args
                .iter()
                .map(|b| Frame::BulkString(Some(b.clone())))
                .collect(),
        )
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates an ECHO command.
#[inline]
pub fn echo(msg: impl Into<Bytes>) -> Cmd {
    Cmd::new("ECHO").arg(msg)
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").key(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").key(key).arg(value)
}

/// Creates a SET command with expiration.
#[inline]
pub fn set_with_expiry(
    key: impl Into<Bytes>,
    value: impl Into<Bytes>,
    expiry: std::time::Duration,
) -> Cmd {
    Cmd::new("SET")
        .key(key)
        .arg(value)
        .arg("PX")
        .arg(expiry.as_millis().to_string())
}

/// Creates a DEL command for one or more keys.
#[inline]
pub fn del<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("DEL"), Cmd::key)
}

/// Creates an EXISTS command for one or more keys.
#[inline]
pub fn exists<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("EXISTS"), Cmd::key)
}

/// Creates an INCR command.
#[inline]
pub fn incr(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("INCR").key(key)
}

/// Creates a MGET command.
#[inline]
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("MGET"), Cmd::key)
}

/// Creates a MSET command.
#[inline]
pub fn mset<K: Into<Bytes>, V: Into<Bytes>>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (key, value)| cmd.key(key).arg(value))
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: u8) -> Cmd {
    Cmd::new("SELECT").arg(db.to_string())
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new("CLIENT").arg("SETNAME").arg(name)
}

/// Creates a SENTINEL GET-MASTER-ADDR-BY-NAME command.
#[inline]
pub fn sentinel_get_master_addr_by_name(master_name: impl Into<Bytes>) -> Cmd {
    Cmd::new("SENTINEL")
        .arg("GET-MASTER-ADDR-BY-NAME")
        .arg(master_name)
}

/// Creates a SUBSCRIBE command for a single channel.
#[inline]
pub fn subscribe(channel: impl Into<Bytes>) -> Cmd {
    Cmd::new("SUBSCRIBE").arg(channel)
}

/// Parses a frame as a Redis response.
#[inline]
pub fn parse_frame_response(frame: Frame) -> Result<Frame> {
    match frame {
        Frame::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Ok(frame),
    }
}

/// Converts a frame to bytes.
#[inline]
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>> {
    match frame {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        Frame::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Err(Error::Protocol {
            message: "unexpected frame type".to_string(),
        }),
    }
}

/// Converts a frame to an integer.
#[inline]
pub fn frame_to_int(frame: Frame) -> Result<i64> {
    match frame {
        Frame::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        other => other.as_int().ok_or_else(|| Error::Protocol {
            message: "invalid integer".to_string(),
        }),
    }
}
