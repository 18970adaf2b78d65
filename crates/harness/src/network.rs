use concord_core::{Operation, RecordId};
use concord_engine::{EngineConfig, EngineError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::runtime::Handle;
use tracing::debug;

use crate::peer::{TestPeer, test_config};

#[derive(Debug, Clone)]
struct Envelope {
    to: usize,
    record_id: RecordId,
    op: Operation,
}

/// Replicas joined by an in-memory channel that delivers in a seeded random
/// order.
pub struct TestNetwork {
    runtime: Handle,
    peers: Vec<TestPeer>,
    in_flight: Vec<Envelope>,
    rng: StdRng,
}

impl TestNetwork {
    pub fn new(runtime: Handle, seed: u64) -> Self {
        Self {
            runtime,
            peers: Vec::new(),
            in_flight: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn add_peer(&mut self, name: &str) -> Result<usize, EngineError> {
        self.add_peer_with_config(name, test_config())
    }

    pub fn add_peer_with_config(&mut self, name: &str, config: EngineConfig) -> Result<usize, EngineError> {
        let peer = TestPeer::with_config(name, config, &self.runtime)?;
        let index = self.peers.len();
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peers(&self) -> &[TestPeer] {
        &self.peers
    }

    /// Queue `ops` for every peer except `from`.
    pub fn broadcast(&mut self, from: usize, record_id: RecordId, ops: impl IntoIterator<Item = Operation>) {
        for op in ops {
            for to in (0..self.peers.len()).filter(|to| *to != from) {
                self.in_flight.push(Envelope {
                    to,
                    record_id,
                    op: op.clone(),
                });
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Deliver everything in flight, plus whatever the peers emit while
    /// handling it, until the network is quiet. Returns the number of
    /// deliveries.
    pub fn deliver_all(&mut self) -> Result<usize, EngineError> {
        let mut delivered = 0;
        loop {
            self.collect_outboxes();
            if self.in_flight.is_empty() {
                return Ok(delivered);
            }
            let mut batch = std::mem::take(&mut self.in_flight);
            batch.shuffle(&mut self.rng);
            for envelope in batch {
                let result = self.peers[envelope.to]
                    .engine
                    .apply_operation(envelope.record_id, envelope.op)?;
                debug!(to = envelope.to, ?result, "delivered");
                delivered += 1;
            }
        }
    }

    /// Deliver every queued copy a second time, in a new order.
    pub fn redeliver(&mut self, record_id: RecordId, ops: &[Operation]) -> Result<(), EngineError> {
        for to in 0..self.peers.len() {
            let mut copies = ops.to_vec();
            copies.shuffle(&mut self.rng);
            for op in copies {
                self.peers[to].engine.apply_operation(record_id, op)?;
            }
        }
        Ok(())
    }

    fn collect_outboxes(&mut self) {
        for from in 0..self.peers.len() {
            for outgoing in self.peers[from].engine.drain_outbox() {
                self.broadcast(from, outgoing.record_id, [outgoing.operation]);
            }
        }
    }

    /// Whether every peer shows the same text for `field`.
    pub fn texts_agree(&self, record_id: RecordId, field: &str) -> Result<bool, EngineError> {
        let mut texts = self
            .peers
            .iter()
            .map(|peer| peer.text(record_id, field));
        let Some(first) = texts.next().transpose()? else {
            return Ok(true);
        };
        for text in texts {
            if text? != first {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
