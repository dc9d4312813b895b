//! Capability aggregation: the merged, tag-filtered surface the proxy
//! serves downstream.
//!
//! The [`registry::ToolRegistry`] caches what each upstream reported; the
//! [`aggregator::Aggregator`] refreshes it and computes per-session views;
//! the [`meta`] module provides the lazy-loading façade
//! (`tool_list`/`tool_schema`/`tool_invoke`); [`cursor`] is the opaque
//! pagination codec spanning heterogeneous upstreams.

pub mod aggregator;
pub mod cursor;
pub mod meta;
pub mod registry;
pub mod schema_cache;

pub use aggregator::{AggregateView, Aggregator, Category, CategoryChange, ChangeSet, QualifiedSets};
pub use cursor::{Cursor, decode_cursor, encode_cursor};
pub use meta::{MetaToolHandler, META_TOOL_LIST, META_TOOL_SCHEMA, META_TOOL_INVOKE};
pub use registry::{ServerCatalog, ToolRegistry};
pub use schema_cache::SchemaCache;
