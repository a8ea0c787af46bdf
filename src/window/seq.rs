//! Truncated sequence number arithmetic.
//!
//! Only the low 24 bits of a byte counter travel on the wire. [`to_absolute`]
//! recovers the full 64-bit offset from a known reference.
//!
//! Precondition: the true distance between `reference` and the value the
//! peer meant never exceeds half the wrap period (2^23 bytes). Window caps
//! must stay well below that or un-wrapping picks the wrong block.

use crate::constants::SEQ_MASK;

const WRAP: u64 = 1 << 24;
const LOW: u64 = WRAP - 1;
const HALF: u64 = LOW >> 1;

/// Resolve a 24-bit wire counter to the absolute offset closest to `reference`.
pub fn to_absolute(reference: u64, truncated: u32) -> u64 {
    let truncated = u64::from(truncated & SEQ_MASK);
    let base = reference & LOW;
    let top = reference & !LOW;

    let diff = if truncated >= base {
        truncated - base
    } else {
        WRAP - (base - truncated + 1)
    };

    if diff > HALF && truncated > base && top > WRAP {
        (top - WRAP) | truncated
    } else if diff <= HALF && truncated < base {
        (top + WRAP) | truncated
    } else {
        top | truncated
    }
}

/// Low 24 bits of an absolute offset, as sent on the wire.
pub fn truncate(absolute: u64) -> u32 {
    (absolute & LOW) as u32
}
