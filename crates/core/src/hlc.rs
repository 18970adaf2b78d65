use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

pub const MAX_DRIFT_MS: u64 = 300_000; // 5 minutes

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// A 12-byte Hybrid Logical Clock timestamp: 8 bytes wall_ms (big-endian u64)
/// followed by 4 bytes counter (big-endian u32).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.wall_ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let mut wall = [0u8; 8];
        let mut counter = [0u8; 4];
        wall.copy_from_slice(&bytes[..8]);
        counter.copy_from_slice(&bytes[8..]);
        Self {
            wall_ms: u64::from_be_bytes(wall),
            counter: u32::from_be_bytes(counter),
        }
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then(self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = crate::ids::serde_bytes_compat(deserializer)?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"12 bytes"))?;
        Ok(Hlc::from_bytes(&arr))
    }
}

/// A clock that generates monotonically increasing HLC timestamps.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: Hlc,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next monotonically increasing timestamp.
    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        let now = physical_now()?;
        let hlc = if now > self.last.wall_ms {
            Hlc::new(now, 0)
        } else {
            Hlc::new(self.last.wall_ms, self.last.counter + 1)
        };
        self.last = hlc;
        Ok(hlc)
    }

    /// Merge with a remote timestamp, producing a timestamp greater than both.
    pub fn receive(&mut self, remote: &Hlc) -> Result<Hlc, CoreError> {
        let now = physical_now()?;

        if remote.wall_ms > now + MAX_DRIFT_MS {
            return Err(CoreError::HlcDriftTooLarge {
                delta_ms: remote.wall_ms - now,
                max_ms: MAX_DRIFT_MS,
            });
        }

        let wall = now.max(self.last.wall_ms).max(remote.wall_ms);
        let counter = if wall == self.last.wall_ms && wall == remote.wall_ms {
            self.last.counter.max(remote.counter) + 1
        } else if wall == self.last.wall_ms {
            self.last.counter + 1
        } else if wall == remote.wall_ms {
            remote.counter + 1
        } else {
            0
        };

        self.last = Hlc::new(wall, counter);
        Ok(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_monotonicity() {
        let mut clock = HlcClock::new();
        let mut prev = clock.tick().unwrap();
        for _ in 0..100 {
            let next = clock.tick().unwrap();
            assert!(next > prev, "expected {next:?} > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn same_wall_time_increments_counter() {
        let mut clock = HlcClock::new();
        let future_ms = physical_now().unwrap() + 100_000;
        clock.last = Hlc::new(future_ms, 0);

        let t1 = clock.tick().unwrap();
        assert_eq!(t1, Hlc::new(future_ms, 1));
        let t2 = clock.tick().unwrap();
        assert_eq!(t2, Hlc::new(future_ms, 2));
    }

    #[test]
    fn ordering_matches_bytes() {
        let pairs = [
            (Hlc::new(100, 0), Hlc::new(200, 0)),
            (Hlc::new(100, 0), Hlc::new(100, 1)),
            (Hlc::new(100, 999), Hlc::new(101, 0)),
        ];
        for (a, b) in &pairs {
            assert_eq!(a.cmp(b), a.to_bytes().cmp(&b.to_bytes()));
            assert!(a < b);
        }
    }

    #[test]
    fn drift_rejection() {
        let mut clock = HlcClock::new();
        let now = physical_now().unwrap();
        let remote = Hlc::new(now + MAX_DRIFT_MS + 1_000, 0);
        match clock.receive(&remote) {
            Err(CoreError::HlcDriftTooLarge { max_ms, .. }) => assert_eq!(max_ms, MAX_DRIFT_MS),
            other => panic!("expected HlcDriftTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn receive_exceeds_both() {
        let mut clock = HlcClock::new();
        let local = clock.tick().unwrap();
        let remote = Hlc::new(local.wall_ms() + 1, 10);
        let merged = clock.receive(&remote).unwrap();
        assert!(merged > local);
        assert!(merged > remote);
    }
}
