//! Tag query language for unimcp.
//!
//! Configured servers carry string tags; sessions carry a tag expression.
//! This crate owns everything about those expressions: the simple comma
//! list, the advanced infix grammar (`+` and, `,` or, `-`/`!` not, parens,
//! word operators), the object query form used by presets, and a memoizing
//! filter cache so hot-path evaluation never reparses.
//!
//! Evaluation is pure: no I/O, no clocks, no allocation beyond the parse.

mod error;
mod expr;
mod filter;
mod parser;
mod preset;
mod query;

pub use error::TagError;
pub use expr::{TagExpression, is_valid_tag};
pub use filter::FilterCache;
pub use parser::{parse_advanced, parse_simple};
pub use preset::{Preset, PresetStore, PresetStrategy};
pub use query::TagQuery;

/// Result alias for tag operations.
pub type TagResult<T> = Result<T, TagError>;
