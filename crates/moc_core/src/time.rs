use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wall-clock microseconds since the Unix epoch. Used for the
/// created/updated provenance stamps on collection links.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Stamp(pub i64);

impl Stamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        Self(micros)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

/// Hybrid logical clock packed into a portable i64: upper bits carry
/// microseconds since epoch, the low bits a tie-breaking counter.
/// Changesets are ordered by this value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hlc(i64);

const HLC_COUNTER_BITS: u32 = 12;
const HLC_COUNTER_MAX: i64 = (1 << HLC_COUNTER_BITS) - 1;

static LAST_HLC: AtomicI64 = AtomicI64::new(0);

impl Hlc {
    pub fn now() -> Self {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let candidate = physical << HLC_COUNTER_BITS;
        let mut last = LAST_HLC.load(Ordering::SeqCst);
        loop {
            let next = if candidate > last {
                candidate
            } else if (last & HLC_COUNTER_MAX) < HLC_COUNTER_MAX {
                last + 1
            } else {
                // Counter exhausted within one microsecond; borrow from the physical part.
                ((last >> HLC_COUNTER_BITS) + 1) << HLC_COUNTER_BITS
            };
            match LAST_HLC.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Hlc(next),
                Err(current) => last = current,
            }
        }
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Self {
        Hlc(value)
    }
}

impl Serialize for Hlc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Hlc(i64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::Hlc;

    #[test]
    fn hlc_is_strictly_monotonic() {
        let mut previous = Hlc::now();
        for _ in 0..1000 {
            let next = Hlc::now();
            assert!(next > previous, "hlc went backwards");
            previous = next;
        }
    }
}
