//! Multi-replica test harness: engines over real SQLite, a deterministic
//! embedder, a store that fails on demand and a network with shuffled
//! delivery.

mod embedder;
mod flaky;
mod network;
mod peer;

pub use embedder::HashEmbedder;
pub use flaky::FlakyStore;
pub use network::TestNetwork;
pub use peer::{TestPeer, test_config};

use tracing_subscriber::EnvFilter;

/// Route engine logs to the test writer. `CONCORD_LOG` selects the filter;
/// safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("CONCORD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
