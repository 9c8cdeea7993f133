//! Hybrid logical timestamps.
//!
//! A `HybridTime` packs physical microseconds since the Unix epoch into the
//! upper 52 bits and a logical counter into the lower 12 bits, so values
//! compare correctly as plain integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of bits reserved for the logical component.
pub const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    pub const fn from_raw(value: u64) -> Self {
        HybridTime(value)
    }

    pub fn from_micros(physical_micros: u64) -> Self {
        HybridTime(physical_micros << LOGICAL_BITS)
    }

    pub fn from_micros_and_logical(physical_micros: u64, logical: u64) -> Self {
        HybridTime((physical_micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub fn is_valid(self) -> bool {
        self != HybridTime::INVALID
    }

    /// Smallest value strictly greater than `self`.
    pub fn incremented(self) -> Self {
        debug_assert!(self.0 < HybridTime::MAX.0);
        HybridTime(self.0.saturating_add(1))
    }

    /// Largest value strictly smaller than `self` (saturates at `MIN`).
    pub fn decremented(self) -> Self {
        HybridTime(self.0.saturating_sub(1))
    }

    pub fn add_duration(self, d: Duration) -> Self {
        let micros = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let physical = self.physical_micros().saturating_add(micros);
        HybridTime::from_micros_and_logical(physical, self.logical())
    }

    pub fn sub_duration(self, d: Duration) -> Self {
        let micros = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let physical = self.physical_micros().saturating_sub(micros);
        HybridTime::from_micros_and_logical(physical, self.logical())
    }

    /// `self` if valid, otherwise `other`.
    pub fn or(self, other: HybridTime) -> HybridTime {
        if self.is_valid() {
            self
        } else {
            other
        }
    }
}

impl Default for HybridTime {
    fn default() -> Self {
        HybridTime::INVALID
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HybridTime::INVALID => f.write_str("<invalid>"),
            HybridTime::MAX => f.write_str("<max>"),
            HybridTime::MIN => f.write_str("<min>"),
            ht => write!(f, "{{ physical: {} logical: {} }}", ht.physical_micros(), ht.logical()),
        }
    }
}

/// A hybrid time paired with the lease bounding it.
///
/// `lease` is the majority-replicated lease expiration; `HybridTime::MAX`
/// means "no lease restriction".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridTimeLease {
    pub time: HybridTime,
    pub lease: HybridTime,
}

impl HybridTimeLease {
    pub fn unbounded(time: HybridTime) -> Self {
        HybridTimeLease {
            time,
            lease: HybridTime::MAX,
        }
    }

    pub fn has_lease(&self) -> bool {
        self.lease != HybridTime::MAX
    }
}
