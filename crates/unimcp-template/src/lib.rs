//! Template rendering for per-session upstream materialization.
//!
//! Templates under `mcpTemplates` carry `{{…}}` placeholders in their
//! string leaves. At session attach the engine renders them against the
//! session's [`ContextData`], producing concrete `McpServerParams`; the
//! canonical hash over the rendered form is the identity that decides
//! whether sessions share an upstream.
//!
//! Rendering is best-effort by contract: unknown paths resolve to the
//! empty string and never raise.

mod context;
mod engine;
mod hash;

pub use context::{ContextData, ContextLookup};
pub use engine::{TemplateError, render_params, render_str};
pub use hash::canonical_hash;
