use std::collections::VecDeque;
use std::time::{Duration, Instant};

use concord_core::{OpId, Operation};

/// Operations parked until their causal dependencies arrive. Bounded in both
/// size and age.
#[derive(Debug, Clone)]
pub struct CausalBuffer {
    pending: VecDeque<Pending>,
    capacity: usize,
    timeout: Duration,
}

#[derive(Debug, Clone)]
struct Pending {
    op: Operation,
    since: Instant,
}

impl CausalBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.pending.iter().any(|p| p.op.operation_id == *id)
    }

    /// Park `op`. A full buffer hands the operation back.
    pub fn push(&mut self, op: Operation, now: Instant) -> Result<(), Operation> {
        if self.pending.len() >= self.capacity {
            return Err(op);
        }
        self.pending.push_back(Pending { op, since: now });
        Ok(())
    }

    /// Remove and return everything that waited longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(Operation, Duration)> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            let waited = now.saturating_duration_since(p.since);
            if waited > timeout {
                expired.push((p.op.clone(), waited));
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove the oldest operation `ready` accepts.
    pub fn take_ready(&mut self, mut ready: impl FnMut(&Operation) -> bool) -> Option<Operation> {
        let idx = self.pending.iter().position(|p| ready(&p.op))?;
        self.pending.remove(idx).map(|p| p.op)
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter().map(|p| &p.op)
    }
}
