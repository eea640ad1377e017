//! Secondary indexes and faceted search for Kiln.
//!
//! The store has no native secondary indexes, so each collection keeps one
//! set per `(facet, value)` pair next to its documents. This crate keeps
//! those sets consistent and queries them.
//!
//! - [`collection`] -- Collection schemas and value normalization
//! - [`manager`] -- [`IndexManager`]: put, update, remove, get, get-all
//! - [`reconcile`] -- Sweep that repairs index sets against documents
//! - [`query`] -- [`QueryEngine`]: multi-facet filters plus free text
//! - [`error`] -- [`IndexError`]

pub mod collection;
pub mod error;
pub mod manager;
pub mod query;
pub mod reconcile;

pub use collection::{CollectionSpec, FacetSpec, Normalize};
pub use error::IndexError;
pub use manager::{IndexManager, Loaded};
pub use query::{FilterValue, QueryEngine, SearchRequest, SearchResult};
pub use reconcile::{ReconcileConfig, ReconcileReport};
