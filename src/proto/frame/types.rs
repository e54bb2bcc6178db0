use bytes::Bytes;

/// A RESP2 frame, as sent to or received from a Redis node.
///
/// Server error replies are kept as [`Frame::Error`] on the wire and turned
/// into [`crate::Error`] values by the connection before they reach the
/// routing layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null ($-1 or *-1).
    Null,
}

impl Frame {
    /// Builds a simple-string frame from text.
    pub fn simple(text: &str) -> Self {
        Frame::SimpleString(text.as_bytes().to_vec())
    }

    /// Builds a bulk-string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Returns the textual content of string-like frames.
    ///
    /// Simple strings, bulk strings and errors are decoded lossily; other
    /// frames yield `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::SimpleString(s) | Frame::Error(s) => Some(String::from_utf8_lossy(s).into_owned()),
            Frame::BulkString(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Returns the integer value, accepting numeric bulk strings as well.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            Frame::BulkString(Some(b)) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Borrows the elements of an array frame.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true if this frame is Null or a null bulk string.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_as_text() {
        assert_eq!(Frame::simple("OK").as_text(), Some("OK".to_string()));
        assert_eq!(Frame::bulk("hello").as_text(), Some("hello".to_string()));
        assert_eq!(Frame::Integer(42).as_text(), None);
        assert_eq!(Frame::BulkString(None).as_text(), None);
    }

    #[test]
    fn test_frame_as_int() {
        assert_eq!(Frame::Integer(42).as_int(), Some(42));
        assert_eq!(Frame::bulk("6379").as_int(), Some(6379));
        assert_eq!(Frame::bulk("port").as_int(), None);
        assert_eq!(Frame::Null.as_int(), None);
    }

    #[test]
    fn test_frame_as_array() {
        let frame = Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)]);
        assert_eq!(frame.as_array().map(|a| a.len()), Some(2));
        assert!(Frame::Integer(1).as_array().is_none());
    }

    #[test]
    fn test_frame_is_null() {
        assert!(Frame::Null.is_null());
        assert!(Frame::BulkString(None).is_null());
        assert!(!Frame::Integer(42).is_null());
    }
}
