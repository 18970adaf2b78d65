pub mod conflict;
pub mod crdt;
pub mod error;
pub mod field_value;
pub mod hlc;
pub mod identity;
pub mod ids;
pub mod lamport;
pub mod operations;
pub mod record;
pub mod relationship;
pub mod vector;
pub mod version_vector;
pub mod wire;

pub use conflict::{
    AuditEntry, Component, Conflict, ConflictKind, ConflictRecord, ConflictStatus, Decision,
    EdgeClaim, OpSummary, Outcome, ResolutionStrategy, VectorSummary,
};
pub use crdt::{Attributes, CharId, LwwMap, OrSet, TextCrdt, TextSpan};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use hlc::{Hlc, HlcClock};
pub use identity::SigningIdentity;
pub use ids::*;
pub use lamport::LamportClock;
pub use operations::{
    FieldKind, FieldMutation, Operation, OperationPayload, RelationshipMutation, VectorMutation,
};
pub use record::{FieldState, MissingDependency, Record};
pub use relationship::{EdgeStatus, Relationship, RelationshipKey, clamp_weight};
pub use vector::{StakeholderVector, VectorState, embedding_checksum};
pub use version_vector::{CausalOrder, VersionVector};
