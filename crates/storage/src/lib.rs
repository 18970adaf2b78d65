pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::StorageError;
pub use memory::MemoryEphemeralStore;
pub use sqlite::SqliteStore;
pub use store::{DurableStore, EphemeralStore, ReplayEntry};
