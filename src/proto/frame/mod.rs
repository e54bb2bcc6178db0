//! Reply frames.
//!
//! The routing layer treats replies as opaque except where it has to read
//! topology (CLUSTER SLOTS) or Sentinel answers.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
