//! The slot function: maps a key to one of the 16384 cluster hash slots.

use crc16::{State, XMODEM};

/// Number of hash slots a cluster key space is partitioned into.
pub const SLOT_COUNT: u16 = 16384;

/// Computes the hash slot that owns `key`.
///
/// Honors the hash-tag convention: if the key contains a non-empty `{...}`
/// section, only its content is hashed, so that related keys can be forced
/// onto the same slot.
pub fn hash_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}

// Everything between the first `{` and the first following `}` determines
// the slot, unless that substring is empty or the brace is never closed.
fn hash_tag(key: &[u8]) -> &[u8] {
    key.iter()
        .position(|b| *b == b'{')
        .and_then(|open| {
            let after_open = open + 1;
            key[after_open..]
                .iter()
                .position(|b| *b == b'}')
                .and_then(|close_offset| {
                    if close_offset != 0 {
                        Some(&key[after_open..after_open + close_offset])
                    } else {
                        None
                    }
                })
        })
        .unwrap_or(key)
}
