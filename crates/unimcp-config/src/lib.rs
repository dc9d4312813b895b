//! Configuration model for unimcp.
//!
//! The config file is the product's primary control surface: upstream
//! server definitions, templates, feature flags, auth, and rate limits.
//! This crate owns parsing and validation, immutable snapshots, the
//! structural diff the selective-reload engine consumes, the debounced
//! file watcher, and the PID file.

mod diff;
mod error;
mod loader;
mod pidfile;
mod types;
mod watcher;

pub use diff::{ConfigDiff, SectionDiff, diff_snapshots};
pub use error::ConfigError;
pub use loader::{load_snapshot, parse_snapshot};
pub use pidfile::{PidFile, PidRecord};
pub use types::{
    AuthSettings, ConfigSnapshot, FeatureFlags, McpServerParams, OAuthDelegation,
    RateLimitSettings, ReloadSettings, TemplateFailureMode, TemplateParams, TemplateSettings,
    TransportKind,
};
pub use watcher::{ConfigWatcher, watch_config};
