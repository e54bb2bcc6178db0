//! RESP2 framing and the crate error type.
//!
//! Only as much of the protocol as the routing layer needs: a frame type,
//! a streaming codec used by the TCP connection, and the error taxonomy
//! every executor reasons about.

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
