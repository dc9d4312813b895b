//! Process-wide wiring.
//!
//! Everything singleton-shaped lives in [`Runtime`], built once in `main`
//! and threaded through explicitly; no module-level mutable state exists
//! in the core.

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dashmap::DashMap;
use unimcp_auth::{
    AuthProvider, AuthProviderConfig, MemoryRepository, OAuthStorage, SlidingWindowLimiter,
};
use unimcp_config::{ConfigSnapshot, load_snapshot};
use unimcp_outbound::{
    ClientConfig, ConnectionKey, ConnectionResolver, ManagerConfig, OutboundManager,
    SessionTemplateIndex, UpstreamNotification,
};
use unimcp_protocol::types::methods;
use unimcp_registry::Aggregator;
use unimcp_tags::PresetStore;

use crate::error::ProxyResult;
use crate::factory::SessionFactory;
use crate::reload::{ReloadConfig, ReloadEngine};
use crate::session::SessionService;

/// Bootstrap options, filled from the CLI.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config_path: PathBuf,
    /// Name advertised in `initialize`; upstreams reporting it are circular.
    pub advertised_name: String,
    /// Shrinks request timeouts for test harnesses.
    pub test_mode: bool,
}

impl RuntimeOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            advertised_name: "unimcp".to_string(),
            test_mode: false,
        }
    }
}

/// The shared runtime context.
pub struct Runtime {
    pub advertised_name: String,
    pub config_path: PathBuf,
    pub config_dir: PathBuf,
    pub snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    pub manager: Arc<OutboundManager>,
    pub aggregator: Arc<Aggregator>,
    pub resolver: ConnectionResolver,
    pub sessions: Arc<SessionService>,
    pub factory: Arc<SessionFactory>,
    pub auth: Arc<AuthProvider>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub presets: Arc<PresetStore>,
    pub reload: Arc<ReloadEngine>,
}

impl Runtime {
    /// Load config, start every enabled upstream, and wire the components.
    ///
    /// An unreadable or invalid config at first load is fatal; the caller
    /// exits non-zero.
    pub async fn bootstrap(options: RuntimeOptions) -> ProxyResult<Arc<Self>> {
        let snapshot_value = load_snapshot(&options.config_path)?;
        let config_dir = options
            .config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let manager_config = ManagerConfig {
            advertised_name: options.advertised_name.clone(),
            client: ClientConfig {
                client_name: options.advertised_name.clone(),
                request_timeout: if options.test_mode {
                    Duration::from_millis(500)
                } else {
                    Duration::from_secs(15)
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let (manager, upstream_notes) = OutboundManager::new(manager_config);

        let template_index: SessionTemplateIndex = Arc::new(DashMap::new());
        let resolver = ConnectionResolver::new(Arc::clone(&manager), Arc::clone(&template_index));
        let factory = Arc::new(SessionFactory::new(
            Arc::clone(&manager),
            Arc::clone(&template_index),
        ));
        let aggregator = Arc::new(Aggregator::new(8));

        let storage = OAuthStorage::in_memory();
        let auth = Arc::new(AuthProvider::new(
            AuthProviderConfig {
                enabled: snapshot_value.auth.enabled,
                session_ttl: Duration::from_millis(snapshot_value.auth.session_ttl_ms),
                code_ttl: Duration::from_millis(snapshot_value.auth.code_ttl_ms),
                auto_approve: snapshot_value.auth.auto_approve,
                ..Default::default()
            },
            storage.clone(),
        ));
        let limiter = Arc::new(SlidingWindowLimiter::new(
            Duration::from_millis(snapshot_value.rate_limits.window_ms),
            snapshot_value.rate_limits.max,
        ));

        let session_repo: Arc<dyn unimcp_auth::KeyValueRepository> =
            Arc::new(MemoryRepository::new());
        let sessions = Arc::new(SessionService::new(
            session_repo,
            Duration::from_millis(snapshot_value.auth.session_ttl_ms),
        ));

        let presets = Arc::new(
            PresetStore::load(config_dir.join("presets.json"))
                .map_err(crate::error::ProxyError::Tags)?,
        );

        let snapshot = Arc::new(ArcSwap::from_pointee(snapshot_value));
        let reload = Arc::new(ReloadEngine::new(
            options.config_path.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&manager),
            Arc::clone(&aggregator),
            Arc::clone(&sessions),
            Arc::clone(&factory),
            resolver.clone(),
            ReloadConfig::default(),
        ));

        let runtime = Arc::new(Self {
            advertised_name: options.advertised_name,
            config_path: options.config_path,
            config_dir,
            snapshot,
            manager,
            aggregator,
            resolver,
            sessions,
            factory,
            auth,
            limiter,
            presets,
            reload,
        });

        // Bring the fleet up, then take the first capability snapshot.
        let initial = runtime.snapshot.load_full();
        runtime.manager.create_all(&initial.mcp_servers).await;
        let outbound = runtime.manager.snapshot();
        runtime.aggregator.refresh_all(&outbound).await;
        runtime.aggregator.update_capabilities(&outbound);
        info!(
            servers = initial.mcp_servers.len(),
            templates = initial.mcp_templates.len(),
            "runtime bootstrapped"
        );

        runtime.spawn_background(upstream_notes);
        Ok(runtime)
    }

    /// Tags currently configured, the scope universe for inbound auth.
    pub fn available_tags(&self) -> Vec<String> {
        self.snapshot.load().available_tags()
    }

    /// Stop everything; called on shutdown.
    pub async fn shutdown(&self) {
        info!("shutting down");
        for session in self.sessions.all() {
            self.factory.detach_session(&session.id).await;
        }
        self.manager.stop_all().await;
    }

    fn spawn_background(
        self: &Arc<Self>,
        mut upstream_notes: mpsc::UnboundedReceiver<UpstreamNotification>,
    ) {
        // Upstream notification pump: list-changed refreshes the registry
        // and fans out to sessions that can see the origin; log messages
        // relay through the per-session level gate.
        {
            let runtime = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((key, note)) = upstream_notes.recv().await {
                    runtime.pump_upstream_note(&key, note).await;
                }
            });
        }

        // Session TTL sweep.
        {
            let runtime = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    for session in runtime.sessions.sweep_expired().await {
                        runtime.factory.detach_session(&session.id).await;
                    }
                }
            });
        }

        // Cache and limiter sweeps.
        unimcp_core::cache::spawn_sweeper(
            self.aggregator.schema_cache().inner(),
            Duration::from_secs(60),
        );
        unimcp_core::cache::spawn_sweeper(
            self.aggregator.filter_cache().inner(),
            Duration::from_secs(60),
        );
        {
            let limiter = Arc::clone(&self.limiter);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    limiter.cleanup();
                }
            });
        }
    }

    async fn pump_upstream_note(
        self: &Arc<Self>,
        key: &ConnectionKey,
        note: unimcp_protocol::jsonrpc::JsonRpcNotification,
    ) {
        match note.method.as_str() {
            // Upstream list-changed and manager connect/disconnect events
            // take the same path: refresh the cache, then diff each
            // session's view against its baseline and notify precisely.
            methods::TOOLS_LIST_CHANGED
            | methods::RESOURCES_LIST_CHANGED
            | methods::PROMPTS_LIST_CHANGED
            | unimcp_outbound::CAPABILITIES_EVENT => {
                debug!(key = %key, method = %note.method, "upstream capability change");
                let outbound = self.manager.snapshot();
                self.aggregator.refresh_all(&outbound).await;
                self.aggregator.update_capabilities(&outbound);
                self.reload.fanout_list_changed();
            }
            methods::LOGGING_MESSAGE => {
                for session in self.sessions.all() {
                    let visible = self.resolver.filter_for_session(&session.id);
                    if visible.contains_key(key) {
                        session.relay_log(note.clone());
                    }
                }
            }
            other => {
                debug!(key = %key, method = %other, "ignoring upstream notification");
            }
        }
    }
}

/// Run the config watcher, feeding the reload engine. Returns the watcher
/// handle; dropping it stops the watch.
pub fn spawn_config_watcher(
    runtime: &Arc<Runtime>,
) -> ProxyResult<unimcp_config::ConfigWatcher> {
    let debounce = Duration::from_millis(runtime.snapshot.load().config_reload.debounce_ms);
    let (watcher, mut signals) = unimcp_config::watch_config(&runtime.config_path, debounce)?;
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            info!("config change detected, reloading");
            runtime.reload.reload_from_file().await;
        }
        warn!("config watcher channel closed");
    });
    Ok(watcher)
}
