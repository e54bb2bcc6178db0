//! Redis Cluster command builders.
//!
//! Commands used for topology discovery and redirect handling.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// Returns information about which cluster slots are mapped to which Redis instances.
/// This is the primary method for discovering cluster topology.
///
/// # Response Format
///
/// Returns an array of slot ranges with their corresponding master and replica nodes.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates an ASKING command.
///
/// Used before retrying a command that received an ASK redirect.
/// ASKING is a one-time flag - it only affects the immediately following command.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command.
///
/// Lets a replica connection serve reads for the slots of its primary.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::frame::Frame;
    use bytes::Bytes;

    #[test]
    fn test_cluster_slots_cmd() {
        let frame = cluster_slots().into_frame();

        if let Frame::Array(arr) = frame {
            assert_eq!(arr.len(), 2);
            assert_eq!(arr[0], Frame::BulkString(Some(Bytes::from("CLUSTER"))));
            assert_eq!(arr[1], Frame::BulkString(Some(Bytes::from("SLOTS"))));
        } else {
            panic!("Expected Array frame");
        }
    }

    #[test]
    fn test_asking_cmd() {
        let cmd = asking();
        assert!(cmd.is_keyless());

        if let Frame::Array(arr) = cmd.into_frame() {
            assert_eq!(arr.len(), 1);
            assert_eq!(arr[0], Frame::BulkString(Some(Bytes::from("ASKING"))));
        } else {
            panic!("Expected Array frame");
        }
    }

    #[test]
    fn test_readonly_cmd() {
        let cmd = readonly();
        assert!(cmd.is_keyless());
        assert_eq!(cmd.name(), "READONLY");
    }
}
