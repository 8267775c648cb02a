//! Time-ordered state identifiers for the group 0 history chain.
//!
//! A state ID names one successful group 0 change. The microsecond timestamp
//! occupies the order-significant half, so the derived ordering is a total
//! order that tracks time; the random tail keeps IDs generated on different
//! nodes from colliding. The timestamp doubles as the write timestamp of
//! every mutation carried by the command bearing the ID.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 128-bit time-ordered unique identifier.
///
/// Field order matters: the derived `Ord` compares `(micros, tail)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId {
    micros: i64,
    tail: u64,
}

impl StateId {
    /// Sentinel meaning "no predecessor" / empty history.
    pub const ZERO: StateId = StateId { micros: 0, tail: 0 };

    pub const ENCODED_LEN: usize = 16;

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Microsecond timestamp embedded in the ID. Mutations carried by the
    /// command bearing this ID use it as their write timestamp.
    pub fn micros(&self) -> i64 {
        self.micros
    }

    /// Generate a fresh ID strictly greater than `prev`.
    ///
    /// The timestamp is `max(now, prev.micros + 1)`, so the chain stays
    /// strictly increasing even when the wall clock repeats a microsecond or
    /// moves backwards.
    pub fn generate_after(prev: StateId) -> StateId {
        let mut micros = now_micros();
        if !prev.is_zero() && micros <= prev.micros {
            micros = prev.micros + 1;
        }
        StateId {
            micros,
            tail: rand::random(),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.micros.to_be_bytes());
        out[8..].copy_from_slice(&self.tail.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; Self::ENCODED_LEN]) -> StateId {
        let mut micros = [0u8; 8];
        let mut tail = [0u8; 8];
        micros.copy_from_slice(&bytes[..8]);
        tail.copy_from_slice(&bytes[8..]);
        StateId {
            micros: i64::from_be_bytes(micros),
            tail: u64::from_be_bytes(tail),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(micros: i64, tail: u64) -> StateId {
        StateId { micros, tail }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.micros, self.tail)
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(i64::MAX as u128) as i64
}
