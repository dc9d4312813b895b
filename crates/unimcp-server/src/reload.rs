//! Selective configuration reload.
//!
//! One reload at a time (single-flight); a request arriving mid-reload
//! sets a pending flag, and any number of queued requests collapse into
//! one follow-up run. Within a run, stops complete before starts and
//! restarts begin. Template reprocessing sits behind a circuit breaker:
//! after `N` consecutive failures templates are disabled for a cooldown
//! window while static reload keeps working.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use unimcp_config::{ConfigSnapshot, diff_snapshots, load_snapshot};
use unimcp_outbound::{ConnectionKey, ConnectionResolver, OutboundManager};
use unimcp_registry::Aggregator;

use crate::factory::SessionFactory;
use crate::session::SessionService;

/// Breaker guarding template reprocessing.
struct BreakerState {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

/// Reload tuning.
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// Consecutive template failures before the breaker opens.
    pub breaker_threshold: u32,
    /// How long templates stay disabled once the breaker opens.
    pub breaker_window: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 3,
            breaker_window: Duration::from_secs(300),
        }
    }
}

/// What a reload did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub stopped: usize,
    pub started: usize,
    pub restarted: usize,
    pub notified_sessions: usize,
    pub templates_skipped: bool,
    pub no_op: bool,
}

/// The engine. One per process.
pub struct ReloadEngine {
    config_path: PathBuf,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    manager: Arc<OutboundManager>,
    aggregator: Arc<Aggregator>,
    sessions: Arc<SessionService>,
    factory: Arc<SessionFactory>,
    resolver: ConnectionResolver,
    running: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    breaker: Mutex<BreakerState>,
    config: ReloadConfig,
}

impl ReloadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config_path: PathBuf,
        snapshot: Arc<ArcSwap<ConfigSnapshot>>,
        manager: Arc<OutboundManager>,
        aggregator: Arc<Aggregator>,
        sessions: Arc<SessionService>,
        factory: Arc<SessionFactory>,
        resolver: ConnectionResolver,
        config: ReloadConfig,
    ) -> Self {
        Self {
            config_path,
            snapshot,
            manager,
            aggregator,
            sessions,
            factory,
            resolver,
            running: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            breaker: Mutex::new(BreakerState {
                consecutive_failures: 0,
                disabled_until: None,
            }),
            config,
        }
    }

    /// Reload from the watched file. Parse or validation failures keep the
    /// previous snapshot and never emit notifications.
    pub async fn reload_from_file(&self) {
        let new_snapshot = match load_snapshot(&self.config_path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "reload rejected, keeping previous config");
                return;
            }
        };
        self.apply(new_snapshot).await;
    }

    /// Apply a new snapshot under the single-flight guard. A call that
    /// finds a reload in progress marks it pending and returns; the
    /// running reload re-reads the file for the collapsed follow-up.
    pub async fn apply(&self, new_snapshot: ConfigSnapshot) -> ReloadOutcome {
        let Ok(guard) = self.running.try_lock() else {
            self.pending.store(true, Ordering::SeqCst);
            return ReloadOutcome {
                no_op: true,
                ..Default::default()
            };
        };

        let mut outcome = self.execute_reload(new_snapshot).await;
        // Collapsed follow-up: at most one, regardless of how many reload
        // requests queued behind us.
        while self.pending.swap(false, Ordering::SeqCst) {
            match load_snapshot(&self.config_path) {
                Ok(snapshot) => {
                    outcome = self.execute_reload(snapshot).await;
                }
                Err(e) => {
                    warn!(error = %e, "queued reload rejected, keeping previous config");
                }
            }
        }
        drop(guard);
        outcome
    }

    /// Manually close the breaker.
    pub fn reset_breaker(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = 0;
        breaker.disabled_until = None;
        info!("template circuit breaker reset");
    }

    fn templates_disabled(&self) -> bool {
        let mut breaker = self.breaker.lock();
        match breaker.disabled_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Window elapsed: auto-reset.
                breaker.disabled_until = None;
                breaker.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_template_result(&self, failures: usize) {
        let mut breaker = self.breaker.lock();
        if failures == 0 {
            breaker.consecutive_failures = 0;
            return;
        }
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.breaker_threshold {
            warn!(
                window_secs = self.config.breaker_window.as_secs(),
                "template reprocessing circuit breaker opened"
            );
            breaker.disabled_until = Some(Instant::now() + self.config.breaker_window);
        }
    }

    async fn execute_reload(&self, new_snapshot: ConfigSnapshot) -> ReloadOutcome {
        let old_snapshot = self.snapshot.load_full();
        let diff = diff_snapshots(&old_snapshot, &new_snapshot);
        if diff.is_empty() {
            info!("config unchanged, reload is a no-op");
            return ReloadOutcome {
                no_op: true,
                ..Default::default()
            };
        }

        info!(
            stop = diff.servers.to_stop.len(),
            start = diff.servers.to_start.len(),
            restart = diff.servers.to_restart.len(),
            templates = diff.touches_templates(),
            "executing selective reload"
        );

        let sessions = self.sessions.all();

        // Stops settle before anything starts.
        for name in &diff.servers.to_stop {
            self.manager
                .remove_one(&ConnectionKey::Static(name.clone()))
                .await;
            self.aggregator.registry().remove(name);
            self.aggregator.schema_cache().invalidate_server(name);
        }

        for name in &diff.servers.to_start {
            if let Some(params) = new_snapshot.mcp_servers.get(name) {
                if let Err(e) = self.manager.create_one(name, params.clone()).await {
                    warn!(server = %name, error = %e, "failed to start server");
                }
            }
        }
        for name in &diff.servers.to_restart {
            if let Some(params) = new_snapshot.mcp_servers.get(name) {
                if let Err(e) = self
                    .manager
                    .restart(&ConnectionKey::Static(name.clone()), params.clone())
                    .await
                {
                    warn!(server = %name, error = %e, "failed to restart server");
                }
                self.aggregator.schema_cache().invalidate_server(name);
            }
        }

        // Template section, behind the breaker. A diff that only touches
        // static servers proceeds even while the breaker is open.
        let mut templates_skipped = false;
        if diff.touches_templates() {
            if self.templates_disabled() {
                warn!("template reprocessing disabled by circuit breaker, skipping");
                templates_skipped = true;
            } else {
                self.factory
                    .stop_removed_templates(&diff.templates.to_stop)
                    .await;
                let failures = self.factory.reprocess(&sessions, &new_snapshot).await;
                self.record_template_result(failures);
            }
        }

        // Publish, refresh, fan out.
        self.snapshot.store(Arc::new(new_snapshot));
        let outbound_snapshot = self.manager.snapshot();
        self.aggregator.refresh_all(&outbound_snapshot).await;
        self.aggregator.update_capabilities(&outbound_snapshot);
        let notified = self.fanout_list_changed();

        ReloadOutcome {
            stopped: diff.servers.to_stop.len(),
            started: diff.servers.to_start.len(),
            restarted: diff.servers.to_restart.len(),
            notified_sessions: notified,
            templates_skipped,
            no_op: false,
        }
    }

    /// Diff every session's view against its baseline and emit
    /// `listChanged` for the categories that actually changed. Returns the
    /// number of sessions notified. Shared by reload and by the upstream
    /// connect/disconnect path.
    pub fn fanout_list_changed(&self) -> usize {
        let mut notified = 0;
        for session in self.sessions.all() {
            let visible = self.resolver.filter_for_session(&session.id);
            let after = self
                .aggregator
                .compute_view(&visible, session.filter.expression.as_ref())
                .qualified();
            let before = session
                .replace_view_baseline(after.clone())
                .unwrap_or_default();
            let tools_changed = before.tools != after.tools;
            let resources_changed = before.resources != after.resources;
            let prompts_changed = before.prompts != after.prompts;
            if tools_changed || resources_changed || prompts_changed {
                SessionService::notify_list_changed(
                    &session,
                    tools_changed,
                    resources_changed,
                    prompts_changed,
                );
                notified += 1;
            }
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::time::Duration;
    use unimcp_auth::MemoryRepository;
    use unimcp_outbound::{ManagerConfig, SessionTemplateIndex};

    fn snapshot(raw: serde_json::Value) -> ConfigSnapshot {
        unimcp_config::parse_snapshot(&raw.to_string()).unwrap()
    }

    fn engine_with(initial: ConfigSnapshot) -> (Arc<ReloadEngine>, Arc<OutboundManager>) {
        let (manager, _notes) = OutboundManager::new(ManagerConfig {
            max_attempts: 1,
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let index: SessionTemplateIndex = Arc::new(DashMap::new());
        let factory = Arc::new(SessionFactory::new(Arc::clone(&manager), Arc::clone(&index)));
        let resolver = ConnectionResolver::new(Arc::clone(&manager), index);
        let sessions = Arc::new(SessionService::new(
            Arc::new(MemoryRepository::new()),
            Duration::from_secs(60),
        ));
        let aggregator = Arc::new(Aggregator::new(4));
        let engine = Arc::new(ReloadEngine::new(
            PathBuf::from("/nonexistent/unimcp.json"),
            Arc::new(ArcSwap::from_pointee(initial)),
            Arc::clone(&manager),
            aggregator,
            sessions,
            factory,
            resolver,
            ReloadConfig::default(),
        ));
        (engine, manager)
    }

    #[tokio::test]
    async fn identical_snapshot_is_a_no_op() {
        let initial = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat", "args": ["--port=1"]}}
        }));
        let (engine, _manager) = engine_with(initial.clone());
        let outcome = engine.apply(initial).await;
        assert!(outcome.no_op);
        assert_eq!(outcome.notified_sessions, 0);
    }

    #[tokio::test]
    async fn restart_and_start_sets_computed() {
        let initial = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat", "args": ["--port=1"]}}
        }));
        let (engine, manager) = engine_with(initial.clone());
        manager
            .create_one("a", initial.mcp_servers["a"].clone())
            .await
            .unwrap();

        let updated = snapshot(serde_json::json!({
            "mcpServers": {
                "a": {"command": "cat", "args": ["--port=2"]},
                "c": {"command": "cat"}
            }
        }));
        let outcome = engine.apply(updated).await;
        assert_eq!(outcome.restarted, 1);
        assert_eq!(outcome.started, 1);
        assert_eq!(outcome.stopped, 0);
        assert!(!outcome.no_op);

        let keys: Vec<String> = manager.snapshot().into_keys().map(|k| k.to_string()).collect();
        assert!(keys.contains(&"a".to_string()));
        assert!(keys.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn stop_removes_connection() {
        let initial = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat"}, "b": {"command": "cat"}}
        }));
        let (engine, manager) = engine_with(initial.clone());
        for (name, params) in &initial.mcp_servers {
            manager.create_one(name, params.clone()).await.unwrap();
        }

        let updated = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat"}}
        }));
        let outcome = engine.apply(updated).await;
        assert_eq!(outcome.stopped, 1);
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_resets() {
        let initial = snapshot(serde_json::json!({}));
        let (engine, _manager) = engine_with(initial);

        engine.record_template_result(1);
        engine.record_template_result(1);
        assert!(!engine.templates_disabled());
        engine.record_template_result(1);
        assert!(engine.templates_disabled());

        engine.reset_breaker();
        assert!(!engine.templates_disabled());
    }

    #[tokio::test]
    async fn breaker_auto_resets_after_window() {
        let initial = snapshot(serde_json::json!({}));
        let (manager, _): (Arc<OutboundManager>, _) = {
            let (m, n) = OutboundManager::new(ManagerConfig::default());
            (m, n)
        };
        let index: SessionTemplateIndex = Arc::new(DashMap::new());
        let resolver = ConnectionResolver::new(Arc::clone(&manager), Arc::clone(&index));
        let engine = ReloadEngine::new(
            PathBuf::from("/nonexistent"),
            Arc::new(ArcSwap::from_pointee(initial)),
            Arc::clone(&manager),
            Arc::new(Aggregator::new(2)),
            Arc::new(SessionService::new(
                Arc::new(MemoryRepository::new()),
                Duration::from_secs(60),
            )),
            Arc::new(SessionFactory::new(manager, index)),
            resolver,
            ReloadConfig {
                breaker_threshold: 1,
                breaker_window: Duration::from_millis(20),
            },
        );

        engine.record_template_result(1);
        assert!(engine.templates_disabled());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!engine.templates_disabled());
    }

    #[tokio::test]
    async fn static_reload_proceeds_while_breaker_open() {
        let initial = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat"}}
        }));
        let (engine, manager) = engine_with(initial.clone());
        manager
            .create_one("a", initial.mcp_servers["a"].clone())
            .await
            .unwrap();

        // Open the breaker.
        for _ in 0..3 {
            engine.record_template_result(1);
        }
        assert!(engine.templates_disabled());

        // A static-only change still lands.
        let updated = snapshot(serde_json::json!({
            "mcpServers": {"a": {"command": "cat"}, "b": {"command": "cat"}}
        }));
        let outcome = engine.apply(updated).await;
        assert_eq!(outcome.started, 1);
        assert!(!outcome.templates_skipped);
    }
}
