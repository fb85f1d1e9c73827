//! qntx-model
//!
//! Immutable attestation and filter types, the watcher configuration record,
//! and the raw-query-string parser. Pure, allocation-light where it matters
//! (filter evaluation), no I/O.

mod attestation;
mod filter;
pub mod query;
mod value;
mod watcher;

pub use attestation::Attestation;
pub use filter::Filter;
pub use query::ParseError;
pub use value::Value;
pub use watcher::{ActionData, CompositionEdge, Watcher, WatcherCounters, DEFAULT_SEMANTIC_THRESHOLD};
