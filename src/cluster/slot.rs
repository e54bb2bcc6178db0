//! Redis Cluster slot calculation.
//!
//! Redis Cluster uses CRC16 to map keys to slots (0-16383).
//! This module provides utilities for calculating slot numbers from keys.

use crc::{Crc, CRC_16_XMODEM};

use crate::core::command::Cmd;
use crate::proto::error::{Error, Result};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM algorithm used by Redis.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a given key.
///
/// Redis uses CRC16 modulo 16384 for slot calculation.
/// If the key contains `{...}`, only the content inside the braces
/// is used for hashing (hash tags).
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "cluster")]
/// # {
/// use routis::cluster::key_slot;
///
/// assert_eq!(key_slot("123456789"), 12739);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// assert_ne!(key_slot("user1000"), key_slot("user2000"));
/// # }
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hash_key = extract_hash_tag(key.as_ref());
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Extracts the hash tag from a key.
///
/// Redis hash tags are defined by `{...}`:
/// - `{user1000}.following` → hash tag is `user1000`
/// - `foo{bar}baz` → hash tag is `bar`
/// - `foo{}{bar}` → first braces are empty, use whole key
/// - `foo` → no hash tag, use whole key
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Returns the slot a command must be routed to.
///
/// A pinned slot wins; otherwise every key must hash to the same slot.
/// Keyless commands yield `None`.
///
/// # Errors
///
/// Returns [`Error::CrossSlot`] if the keys map to different slots.
pub fn command_slot(cmd: &Cmd) -> Result<Option<u16>> {
    if let Some(slot) = cmd.pinned_slot() {
        return Ok(Some(slot % SLOT_COUNT));
    }
    let mut slot = None;
    for key in cmd.keys() {
        let this_slot = key_slot(key);
        match slot {
            None => slot = Some(this_slot),
            Some(s) if s != this_slot => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command;

    #[test]
    fn test_slot_count() {
        assert_eq!(SLOT_COUNT, 16384);
    }

    #[test]
    fn test_key_slot_known_values() {
        // Reference values from the Redis Cluster specification and redis-cli.
        assert_eq!(key_slot("123456789"), 12739);
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot(""), 0);
    }

    #[test]
    fn test_key_slot_with_hash_tag() {
        let slot1 = key_slot("{user1000}.following");
        let slot2 = key_slot("{user1000}.followers");
        let slot3 = key_slot("user1000");

        assert_eq!(slot1, slot2);
        assert_eq!(slot2, slot3);
    }

    #[test]
    fn test_key_slot_binary_key() {
        let key: &[u8] = &[0xff, 0x00, b'{', b'a', b'}', 0x80];
        assert_eq!(key_slot(key), key_slot("a"));
    }

    #[test]
    fn test_extract_hash_tag_simple() {
        assert_eq!(extract_hash_tag(b"foo{bar}"), b"bar");
        assert_eq!(extract_hash_tag(b"{user1000}.following"), b"user1000");
        assert_eq!(extract_hash_tag(b"prefix{tag}suffix"), b"tag");
    }

    #[test]
    fn test_extract_hash_tag_empty() {
        // Empty hash tag should use whole key
        assert_eq!(extract_hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(extract_hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(extract_hash_tag(b"{}"), b"{}");
    }

    #[test]
    fn test_extract_hash_tag_multiple_braces() {
        // Only first valid pair is used
        assert_eq!(extract_hash_tag(b"foo{bar}{baz}"), b"bar");
        assert_eq!(extract_hash_tag(b"{a}{b}{c}"), b"a");
    }

    #[test]
    fn test_extract_hash_tag_unmatched() {
        assert_eq!(extract_hash_tag(b"foo{bar"), b"foo{bar");
        assert_eq!(extract_hash_tag(b"foo}bar"), b"foo}bar");
        assert_eq!(extract_hash_tag(b"{"), b"{");
    }

    #[test]
    fn test_key_slot_distribution() {
        let mut slots = std::collections::HashSet::new();
        for i in 0..100 {
            slots.insert(key_slot(format!("key{}", i)));
        }
        assert!(slots.len() >= 50, "Keys should distribute across slots");
    }

    #[test]
    fn test_command_slot() {
        assert_eq!(command_slot(&command::ping()).unwrap(), None);
        assert_eq!(
            command_slot(&command::get("foo")).unwrap(),
            Some(key_slot("foo"))
        );
        assert_eq!(
            command_slot(&command::mget(["{u1}.a", "{u1}.b"])).unwrap(),
            Some(key_slot("u1"))
        );
        assert!(matches!(
            command_slot(&command::mget(["foo", "bar"])),
            Err(Error::CrossSlot)
        ));
        assert_eq!(
            command_slot(&command::get("foo").with_slot(7)).unwrap(),
            Some(7)
        );
    }
}
