//! `CLUSTER SLOTS` parsing.
//!
//! The routing layer only needs `(start, end, primary, replicas)` tuples;
//! everything else in the reply (node ids, hostnames metadata) is ignored.

use crate::cluster::slot::SLOT_COUNT;
use crate::core::node::HostAndPort;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A range of hash slots served by one primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
    /// Primary serving this range
    pub primary: HostAndPort,
    /// Replicas of the primary
    pub replicas: Vec<HostAndPort>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false: a parsed range holds at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parsed `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Slot ranges in reply order
    pub slot_ranges: Vec<SlotRange>,
}

impl ClusterTopology {
    /// Parses cluster topology from a CLUSTER SLOTS response.
    ///
    /// Entries without a primary are skipped, as are replica entries that
    /// cannot be parsed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if:
    /// - The frame is not an array
    /// - A slot number is out of range or the range is inverted
    /// - A primary address is malformed
    pub fn from_cluster_slots(frame: &Frame) -> Result<Self> {
        let ranges = frame
            .as_array()
            .ok_or_else(|| protocol("CLUSTER SLOTS response must be an array"))?;

        let mut slot_ranges = Vec::with_capacity(ranges.len());
        for range in ranges {
            let Some(entry) = range.as_array() else {
                continue;
            };
            // start, end, primary [, replica ...]
            if entry.len() < 3 {
                continue;
            }

            let start = parse_slot(&entry[0])?;
            let end = parse_slot(&entry[1])?;
            if end < start {
                return Err(protocol(format!("inverted slot range {start}-{end}")));
            }

            let primary = parse_node(&entry[2])?;
            let replicas = entry[3..]
                .iter()
                .filter_map(|node| parse_node(node).ok())
                .collect();

            slot_ranges.push(SlotRange {
                start,
                end,
                primary,
                replicas,
            });
        }

        Ok(Self { slot_ranges })
    }

    /// Returns true if the reply assigned no slot at all.
    pub fn is_empty(&self) -> bool {
        self.slot_ranges.is_empty()
    }

    /// Returns true if every slot is assigned exactly once.
    pub fn has_full_coverage(&self) -> bool {
        let mut covered = vec![false; usize::from(SLOT_COUNT)];
        for range in &self.slot_ranges {
            for slot in range.start..=range.end {
                let seen = &mut covered[usize::from(slot)];
                if *seen {
                    return false;
                }
                *seen = true;
            }
        }
        covered.iter().all(|&c| c)
    }

    /// Every node mentioned in the reply, primaries first, without duplicates.
    pub fn nodes(&self) -> Vec<HostAndPort> {
        let mut nodes = self.primaries();
        for range in &self.slot_ranges {
            for replica in &range.replicas {
                if !nodes.contains(replica) {
                    nodes.push(replica.clone());
                }
            }
        }
        nodes
    }

    /// Nodes owning at least one slot.
    pub fn primaries(&self) -> Vec<HostAndPort> {
        let mut primaries: Vec<HostAndPort> = Vec::new();
        for range in &self.slot_ranges {
            if !primaries.contains(&range.primary) {
                primaries.push(range.primary.clone());
            }
        }
        primaries
    }
}

fn parse_slot(frame: &Frame) -> Result<u16> {
    frame
        .as_int()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|&n| n < SLOT_COUNT)
        .ok_or_else(|| protocol(format!("invalid slot number {frame:?}")))
}

fn parse_node(frame: &Frame) -> Result<HostAndPort> {
    let node = frame
        .as_array()
        .ok_or_else(|| protocol("node info must be an array"))?;
    if node.len() < 2 {
        return Err(protocol("node info must hold at least host and port"));
    }
    let host = node[0]
        .as_text()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| protocol("node host must be a non-empty string"))?;
    let port = node[1]
        .as_int()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| protocol("node port must be an integer"))?;
    Ok(HostAndPort::new(host, port))
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::cluster_slots_frame;
    use bytes::Bytes;

    fn node(port: u16) -> HostAndPort {
        HostAndPort::new("127.0.0.1", port)
    }

    #[test]
    fn test_slot_range_contains() {
        let range = SlotRange {
            start: 0,
            end: 5460,
            primary: node(7000),
            replicas: Vec::new(),
        };

        assert!(range.contains(0));
        assert!(range.contains(5460));
        assert!(!range.contains(5461));
        assert_eq!(range.len(), 5461);
    }

    #[test]
    fn test_cluster_topology_from_slots_with_replicas() {
        let frame = Frame::Array(vec![Frame::Array(vec![
            Frame::Integer(0),
            Frame::Integer(5460),
            Frame::Array(vec![
                Frame::BulkString(Some(Bytes::from("127.0.0.1"))),
                Frame::Integer(7000),
                Frame::BulkString(Some(Bytes::from("master1"))),
            ]),
            Frame::Array(vec![
                Frame::BulkString(Some(Bytes::from("127.0.0.1"))),
                Frame::Integer(7003),
                Frame::BulkString(Some(Bytes::from("replica1"))),
            ]),
        ])]);

        let topology = ClusterTopology::from_cluster_slots(&frame).unwrap();

        assert_eq!(topology.slot_ranges.len(), 1);
        assert_eq!(topology.slot_ranges[0].primary, node(7000));
        assert_eq!(topology.slot_ranges[0].replicas, vec![node(7003)]);
        assert_eq!(topology.nodes(), vec![node(7000), node(7003)]);
        assert_eq!(topology.primaries(), vec![node(7000)]);
        assert!(!topology.has_full_coverage());
    }

    #[test]
    fn test_full_coverage() {
        let frame = cluster_slots_frame(&[
            (0, 8000, node(7000), vec![]),
            (8001, 16383, node(7001), vec![node(7002)]),
        ]);
        let topology = ClusterTopology::from_cluster_slots(&frame).unwrap();
        assert!(topology.has_full_coverage());
    }

    #[test]
    fn test_holes_and_overlaps_are_not_full_coverage() {
        let holes = cluster_slots_frame(&[
            (0, 8000, node(7000), vec![]),
            (8002, 16383, node(7001), vec![]),
        ]);
        assert!(!ClusterTopology::from_cluster_slots(&holes)
            .unwrap()
            .has_full_coverage());

        let overlap = cluster_slots_frame(&[
            (0, 8001, node(7000), vec![]),
            (8001, 16383, node(7001), vec![]),
        ]);
        assert!(!ClusterTopology::from_cluster_slots(&overlap)
            .unwrap()
            .has_full_coverage());
    }

    #[test]
    fn test_empty_reply() {
        let topology = ClusterTopology::from_cluster_slots(&Frame::Array(vec![])).unwrap();
        assert!(topology.is_empty());
        assert!(!topology.has_full_coverage());
    }

    #[test]
    fn test_entries_without_primary_are_skipped() {
        let frame = Frame::Array(vec![Frame::Array(vec![
            Frame::Integer(0),
            Frame::Integer(100),
        ])]);
        assert!(ClusterTopology::from_cluster_slots(&frame)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cluster_topology_invalid_frame() {
        let frame = Frame::SimpleString(b"invalid".to_vec());
        assert!(ClusterTopology::from_cluster_slots(&frame).is_err());

        let bad_slot = Frame::Array(vec![Frame::Array(vec![
            Frame::Integer(0),
            Frame::Integer(20000),
            Frame::Array(vec![Frame::bulk("127.0.0.1"), Frame::Integer(7000)]),
        ])]);
        assert!(ClusterTopology::from_cluster_slots(&bad_slot).is_err());
    }
}
