//! Conflict-free replicated field types.
//!
//! Every merge here is commutative, associative, and idempotent given causal
//! delivery of the operations that reference each other.

pub mod map;
pub mod set;
pub mod text;

pub use map::LwwMap;
pub use set::OrSet;
pub use text::{Attributes, CharId, FormatMark, TextCrdt, TextItem, TextSpan};
