//! Configuration types.
//!
//! `McpServerParams` mirrors the stable cross-language schema: a `type`
//! discriminator plus per-transport fields, validated at load rather than
//! encoded as a tagged enum, so unknown combinations produce config
//! diagnostics instead of serde errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    /// Alias accepted for streamable HTTP in older config files.
    Http,
    StreamableHttp,
    /// A stdio subprocess that itself proxies to a remote server.
    StdioProxy,
}

impl TransportKind {
    /// True for kinds that spawn a subprocess.
    pub fn is_stdio(self) -> bool {
        matches!(self, Self::Stdio | Self::StdioProxy)
    }

    /// True for kinds that dial a URL.
    pub fn is_network(self) -> bool {
        !self.is_stdio()
    }
}

/// Template sharing flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParams {
    /// One upstream per distinct rendered hash, shared across sessions.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shareable: bool,
    /// One upstream per session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub per_client: bool,
}

impl TemplateParams {
    /// Per-client is the default when neither flag is set.
    pub fn is_per_client(self) -> bool {
        self.per_client || !self.shareable
    }
}

/// One configured upstream server or template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerParams {
    /// Transport discriminator. Defaults to stdio when `command` is set,
    /// otherwise streamable HTTP; the loader normalizes this.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,

    // stdio fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    // network fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// OAuth delegation settings for network transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthDelegation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restart_on_exit: bool,

    /// Present only for entries under `mcpTemplates`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateParams>,

    /// Transport connect deadline, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
    /// Per-request deadline, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
}

impl McpServerParams {
    /// The effective transport kind after loader normalization.
    pub fn transport(&self) -> TransportKind {
        self.kind.unwrap_or(if self.command.is_some() {
            TransportKind::Stdio
        } else {
            TransportKind::StreamableHttp
        })
    }

    /// Effective template flags (per-client by default).
    pub fn template_params(&self) -> TemplateParams {
        self.template.unwrap_or_default()
    }
}

/// Outbound OAuth delegation settings for one upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthDelegation {
    /// Authorization endpoint on the upstream's issuer.
    pub authorization_url: String,
    /// Token endpoint on the upstream's issuer.
    pub token_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// How template rendering failures are handled during reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFailureMode {
    /// Keep going; failed templates are skipped with a warning.
    #[default]
    Graceful,
    /// Fail the reload.
    Strict,
}

/// `templateSettings` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSettings {
    #[serde(default)]
    pub validate_on_reload: bool,
    #[serde(default)]
    pub failure_mode: TemplateFailureMode,
    #[serde(default)]
    pub cache_context: bool,
}

/// Feature flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Inject the meta-tool façade (`tool_list`/`tool_schema`/`tool_invoke`).
    #[serde(default)]
    pub lazy_loading: bool,
    /// Default for sessions that do not request pagination explicitly.
    #[serde(default)]
    pub pagination: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            lazy_loading: false,
            pagination: false,
        }
    }
}

/// Sliding-window rate limits for the OAuth endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 60,
        }
    }
}

/// Inbound auth settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Access-token (and session) TTL, milliseconds.
    #[serde(default = "AuthSettings::default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// Authorization-code TTL, milliseconds. Capped at 60 s by the issuer.
    #[serde(default = "AuthSettings::default_code_ttl_ms")]
    pub code_ttl_ms: u64,
    /// Skip the consent form and auto-approve valid requests.
    #[serde(default)]
    pub auto_approve: bool,
}

impl AuthSettings {
    fn default_session_ttl_ms() -> u64 {
        24 * 60 * 60 * 1000
    }

    fn default_code_ttl_ms() -> u64 {
        60_000
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            session_ttl_ms: Self::default_session_ttl_ms(),
            code_ttl_ms: Self::default_code_ttl_ms(),
            auto_approve: false,
        }
    }
}

/// `configReload` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSettings {
    #[serde(default = "ReloadSettings::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl ReloadSettings {
    fn default_debounce_ms() -> u64 {
        100
    }
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

/// An immutable, validated configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerParams>,
    #[serde(default)]
    pub mcp_templates: BTreeMap<String, McpServerParams>,
    #[serde(default)]
    pub template_settings: TemplateSettings,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub config_reload: ReloadSettings,
}

impl ConfigSnapshot {
    /// Union of tags across servers and templates, sorted and deduplicated.
    /// This is the scope universe for inbound OAuth.
    pub fn available_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .mcp_servers
            .values()
            .chain(self.mcp_templates.values())
            .flat_map(|p| p.tags.iter().cloned())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Servers eligible for startup (not disabled).
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerParams)> {
        self.mcp_servers.iter().filter(|(_, p)| !p.disabled)
    }
}
