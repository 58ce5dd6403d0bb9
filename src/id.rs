//! Time-sortable record identifiers.
//!
//! The default id generator produces 26-character Crockford base-32 strings
//! of a 48-bit millisecond timestamp followed by 80 bits of randomness.
//! Lexicographic order of the encoded form equals generation order across
//! millisecond ticks; within one millisecond the generator increments the
//! random part, so ids from a single process are strictly monotone.

use rand::RngCore;

use std::{fmt, str::FromStr, sync::Mutex};

use crate::{tuple::TupleElement, Error, Result};

const ENCODED_LEN: usize = 26;
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TIMESTAMP_BITS: u32 = 48;
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

/// A 128-bit time-sortable identifier.
///
/// Stored as raw bits; rendered as 26 Crockford base-32 characters. The
/// string form is what gets tuple-packed, so any two ids compare the same
/// way as strings, as raw bits and as generation timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    bits: u128,
}

static GENERATOR: Mutex<(u64, u128)> = Mutex::new((0, 0));

impl RecordId {
    /// Generates a fresh id for the current moment.
    pub fn generate() -> Self {
        let now = chrono::Utc::now().timestamp_millis() as u64 & ((1 << TIMESTAMP_BITS) - 1);
        let mut state = GENERATOR.lock().expect("id generator poisoned");
        let (last_ms, last_random) = *state;
        let (ms, random) = if now == last_ms {
            // Same tick: increment the random part to stay monotone. On the
            // (astronomically unlikely) overflow, borrow the next tick.
            match (last_random + 1) & RANDOM_MASK {
                0 => (now + 1, Self::fresh_random()),
                next => (now, next),
            }
        } else {
            (now, Self::fresh_random())
        };
        *state = (ms, random);
        Self {
            bits: (u128::from(ms) << RANDOM_BITS) | random,
        }
    }

    fn fresh_random() -> u128 {
        let mut bytes = [0_u8; 10];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut random = 0_u128;
        for byte in bytes {
            random = (random << 8) | u128::from(byte);
        }
        random
    }

    /// The 48-bit millisecond timestamp this id was generated at.
    pub fn timestamp_millis(&self) -> u64 {
        (self.bits >> RANDOM_BITS) as u64
    }

    /// Reconstructs an id from raw bits (e.g. a foreign ULID).
    pub fn from_bits(bits: u128) -> Result<Self> {
        if bits.checked_shr(TIMESTAMP_BITS + RANDOM_BITS).unwrap_or(0) != 0 {
            return Err(Error::InvalidArgument("record id exceeds 128 bits".into()));
        }
        Ok(Self { bits })
    }

    /// The raw 128 bits.
    pub fn to_bits(self) -> u128 {
        self.bits
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0_u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (ENCODED_LEN - 1 - i) as u32;
            *slot = ALPHABET[((self.bits >> shift) & 0x1F) as usize];
        }
        // Alphabet output is always ASCII.
        f.write_str(std::str::from_utf8(&out).expect("ascii"))
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            return Err(Error::InvalidArgument(format!(
                "record id must be {ENCODED_LEN} characters, got {}",
                s.len()
            )));
        }
        // 26 * 5 = 130 bits; the top two must be zero for the value to fit.
        if s.as_bytes()[0] > b'7' {
            return Err(Error::InvalidArgument("record id out of range".into()));
        }
        let mut bits = 0_u128;
        for ch in s.bytes() {
            let digit = decode_digit(ch).ok_or_else(|| {
                Error::InvalidArgument(format!("invalid record-id character {:?}", ch as char))
            })?;
            bits = (bits << 5) | u128::from(digit);
        }
        Ok(Self { bits })
    }
}

fn decode_digit(ch: u8) -> Option<u8> {
    let upper = ch.to_ascii_uppercase();
    ALPHABET.iter().position(|&a| a == upper).map(|i| i as u8)
}

impl From<RecordId> for TupleElement {
    fn from(id: RecordId) -> Self {
        Self::String(id.to_string())
    }
}
