//! The three batch-fetch strategies built on the engine.
//!
//! Each loader pairs a canonical [`LoaderIdentity`](crate::LoaderIdentity) with one bulk query
//! against an external source trait. The persistence layer implements the source traits.

mod foreign_key;
mod relation;
mod singleton;

pub use foreign_key::{ForeignKeyLoader, Scope, ScopedSource};
pub use relation::{RelationLoader, RelationSource};
pub use singleton::{RecordSource, SingletonLoader};
