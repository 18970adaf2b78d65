use serde::{Deserialize, Serialize};

/// Logical counter establishing a partial causal order between events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.time
    }

    /// Advance for a locally generated event.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Fold in a remote timestamp so later local events order after it.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_then_tick_orders_after_remote() {
        let mut clock = LamportClock::new();
        clock.tick();
        clock.observe(41);
        assert_eq!(clock.tick(), 42);
        clock.observe(3);
        assert_eq!(clock.current(), 42);
    }
}
