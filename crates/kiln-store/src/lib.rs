//! Primitive store layer for Kiln.
//!
//! Kiln runs on a schemaless key-value store that only offers primitive
//! operations: strings, sets, sorted sets, lists, counters and TTLs. This
//! crate is the contract for that store.
//!
//! - [`store`] -- [`Store`], the cloneable handle services hold
//! - [`dragonfly`] -- `Dragonfly`/Redis backend via [`fred`]
//! - [`memory`] -- In-process backend with identical semantics
//! - [`codec`] -- The one typed decode boundary for stored JSON
//! - [`keys`] -- Key layout
//! - [`error`] -- [`StoreError`]

pub mod codec;
pub mod dragonfly;
pub mod error;
pub mod keys;
pub mod memory;
pub mod store;

pub use dragonfly::DragonflyStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::Store;
