//! Worker lifecycle supervision.
//!
//! The `Supervisor` owns the registry of worker instances and is the only
//! component that spawns, stops or restarts worker processes.
//!
//! Key design decisions:
//! - **Per-name serialization**: start, stop, restart, exit handling and the
//!   auto-restart fire all take the per-name lock, so transitions for one
//!   name never interleave. Different names proceed in parallel.
//! - **Short registry holds**: the registry lock only guards map reads and
//!   writes; grace periods, stop timeouts and handshakes run without it.
//! - **Generations**: every start gets a fresh generation. Exit notifications
//!   and pending auto-restarts carry the generation they belong to and are
//!   dropped when it no longer matches.
//! - **Shutdown gate**: the shutdown flag is set before anything is stopped and
//!   is re-read by the backoff task when it fires.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, join_all};
use mcpvisor_config::ConfigStore;
use mcpvisor_core::{
    ConfigSnapshot, EventEmitter, ExitInfo, McpErrorInfo, McpEvent, McpTool, ServerConfig,
    ServerStatusEntry, StatusSummary, ToolCallError, WorkerSnapshot, WorkerStatus,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::CapabilityClient;
use crate::process::{self, WorkerProcess};
use crate::reconcile::{self, ReconcileAction};
use crate::transport::StdioChannel;

/// Errors from supervisor lifecycle operations.
///
/// Failures are also reported as `server_error` events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("Server already running: {0}")]
    AlreadyRunning(String),

    #[error("Failed to spawn '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    #[error("Server '{server}' exited during startup ({exit})")]
    StartupCrashed { server: String, exit: ExitInfo },

    #[error("Server '{0}' is not configured or is disabled")]
    NotConfigured(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// Timing and policy knobs.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long a new process must survive to count as running.
    pub startup_grace: Duration,
    /// SIGTERM → SIGKILL escalation timeout.
    pub stop_timeout: Duration,
    /// Pause between stop and start in `restart_server`.
    pub restart_delay: Duration,
    /// Delay before an auto-restart after an unexpected exit.
    pub restart_backoff: Duration,
    /// Global auto-restart switch.
    pub auto_restart: bool,
    /// Bound on the whole capability handshake.
    pub handshake_timeout: Duration,
    /// Bound on a single tool call.
    pub tool_call_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_millis(5000),
            restart_delay: Duration::from_millis(1000),
            restart_backoff: Duration::from_millis(2000),
            auto_restart: true,
            handshake_timeout: Duration::from_secs(5),
            tool_call_timeout: Duration::from_secs(30),
        }
    }
}

impl SupervisorOptions {
    #[must_use]
    pub const fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }
}

/// Registry entry. Owned exclusively by the supervisor.
struct WorkerInstance {
    state: WorkerSnapshot,
    generation: u64,
    process: Option<WorkerProcess>,
    channel: Option<Arc<StdioChannel>>,
    client: Option<Arc<CapabilityClient>>,
}

impl WorkerInstance {
    fn starting(config: ServerConfig, generation: u64) -> Self {
        Self {
            state: WorkerSnapshot {
                name: config.name.clone(),
                config,
                status: WorkerStatus::Starting,
                pid: None,
                started_at: None,
                tools: Vec::new(),
                capabilities: false,
                last_error: None,
                last_exit: None,
            },
            generation,
            process: None,
            channel: None,
            client: None,
        }
    }

    /// Move to `stopped`, handing back whatever still needs tearing down.
    fn mark_stopped(&mut self, exit: Option<ExitInfo>) -> Teardown {
        self.state.status = WorkerStatus::Stopped;
        self.state.pid = None;
        self.state.tools.clear();
        self.state.capabilities = false;
        if exit.is_some() {
            self.state.last_exit = exit;
        }
        Teardown {
            process: self.process.take(),
            channel: self.channel.take(),
            client: self.client.take(),
        }
    }

    fn mark_error(&mut self, message: String, exit: Option<ExitInfo>) {
        self.state.status = WorkerStatus::Error;
        self.state.pid = None;
        self.state.last_error = Some(message);
        self.state.last_exit = exit;
    }
}

/// Resources detached from an instance, released outside the registry lock.
#[derive(Default)]
struct Teardown {
    process: Option<WorkerProcess>,
    channel: Option<Arc<StdioChannel>>,
    client: Option<Arc<CapabilityClient>>,
}

impl Teardown {
    /// Close the session, then terminate the process. Never fails.
    async fn run(self) -> Option<ExitInfo> {
        if let Some(client) = self.client {
            client.close().await;
        }
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
        match self.process {
            Some(process) => Some(process.stop().await),
            None => None,
        }
    }
}

struct Inner {
    config: Arc<ConfigStore>,
    options: SupervisorOptions,
    emitter: Arc<dyn EventEmitter>,
    workers: RwLock<HashMap<String, WorkerInstance>>,
    name_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    /// Last snapshot reconciled against. The lock also serializes passes.
    applied: Mutex<Arc<ConfigSnapshot>>,
}

/// Process supervisor for configured tool servers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        options: SupervisorOptions,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let applied = config.snapshot();
        Self {
            inner: Arc::new(Inner {
                config,
                options,
                emitter,
                workers: RwLock::new(HashMap::new()),
                name_locks: std::sync::Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                applied: Mutex::new(applied),
            }),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every enabled entry concurrently.
    ///
    /// One failing entry never prevents the others from starting; each
    /// outcome is returned alongside its name.
    pub async fn initialize(&self) -> Vec<(String, Result<WorkerSnapshot, SupervisorError>)> {
        let snapshot = self.inner.config.snapshot();
        *self.inner.applied.lock().await = Arc::clone(&snapshot);

        let starts = snapshot.enabled().cloned().map(|config| async move {
            let name = config.name.clone();
            let result = self.start_server(&name, config).await;
            (name, result)
        });
        let results = join_all(starts).await;

        let running = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            configured = snapshot.len(),
            enabled = snapshot.enabled_count(),
            running,
            "Supervisor initialized"
        );
        results
    }

    /// Start a worker for `name` from `config`.
    pub async fn start_server(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<WorkerSnapshot, SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.start_locked(name, config).await
    }

    /// Stop a worker. No-op when no instance exists.
    pub async fn stop_server(&self, name: &str) {
        let lock = self.name_lock(name);
        {
            let _guard = lock.lock().await;
            self.stop_locked(name).await;
        }
        self.release_name_lock(name, lock);
    }

    /// Stop, wait `restart_delay`, then start with the current configuration.
    pub async fn restart_server(&self, name: &str) -> Result<WorkerSnapshot, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        self.stop_locked(name).await;
        tokio::time::sleep(self.inner.options.restart_delay).await;

        let Some(config) = self.inner.config.snapshot().get_enabled(name).cloned() else {
            self.inner.workers.write().await.remove(name);
            return Err(SupervisorError::NotConfigured(name.to_string()));
        };
        self.start_locked(name, config).await
    }

    /// Stop a worker and drop it from the registry.
    pub async fn remove_server(&self, name: &str) {
        let lock = self.name_lock(name);
        {
            let _guard = lock.lock().await;
            self.stop_locked(name).await;
            self.inner.workers.write().await.remove(name);
        }
        self.release_name_lock(name, lock);
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let names: Vec<String> = self.inner.workers.read().await.keys().cloned().collect();
        info!(count = names.len(), "Shutting down MCP servers");

        join_all(names.iter().map(|name| self.stop_server(name))).await;
        self.inner.workers.write().await.clear();

        info!("Supervisor shut down");
    }

    async fn start_locked(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<WorkerSnapshot, SupervisorError> {
        let generation = {
            let mut workers = self.inner.workers.write().await;
            // Checked under the registry lock so shutdown sees every instance it must stop.
            if self.is_shutting_down() {
                return Err(SupervisorError::ShuttingDown);
            }
            if let Some(existing) = workers.get(name) {
                if matches!(
                    existing.state.status,
                    WorkerStatus::Running | WorkerStatus::Starting
                ) {
                    return Err(SupervisorError::AlreadyRunning(name.to_string()));
                }
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            workers.insert(
                name.to_string(),
                WorkerInstance::starting(config.clone(), generation),
            );
            generation
        };

        info!(server_name = %name, command = %config.command, "Starting MCP server");

        let overlay = self.inner.config.overlay();
        let spawned = match process::spawn(&config, &overlay) {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                error!(server_name = %name, error = %reason, "Failed to spawn MCP server");
                let message = format!("spawn failed: {reason}");
                self.fail_start(name, generation, McpErrorInfo::spawn(name, message), None)
                    .await;
                return Err(SupervisorError::SpawnFailed {
                    server: name.to_string(),
                    reason,
                });
            }
        };

        let process::SpawnedProcess {
            mut child,
            pid,
            channel,
        } = spawned;

        if let Some(exit) = process::wait_startup(&mut child, self.inner.options.startup_grace).await
        {
            channel.close().await;
            warn!(server_name = %name, pid, %exit, "MCP server exited during startup");
            let message = format!("exited during startup ({exit})");
            self.fail_start(
                name,
                generation,
                McpErrorInfo::startup_crash(name, message),
                Some(exit),
            )
            .await;
            return Err(SupervisorError::StartupCrashed {
                server: name.to_string(),
                exit,
            });
        }

        let process = WorkerProcess::monitor(
            child,
            pid,
            self.inner.options.stop_timeout,
            exit_callback(Arc::downgrade(&self.inner), name.to_string(), generation),
        );

        {
            let mut workers = self.inner.workers.write().await;
            if let Some(instance) = workers.get_mut(name) {
                instance.state.status = WorkerStatus::Running;
                instance.state.pid = Some(pid);
                instance.state.started_at = Some(Utc::now());
                instance.process = Some(process);
                instance.channel = Some(Arc::clone(&channel));
            }
        }

        // Best effort: a worker that does not speak the protocol keeps running without tools.
        match CapabilityClient::negotiate(name, channel, self.inner.options.handshake_timeout).await
        {
            Ok(client) => {
                let mut workers = self.inner.workers.write().await;
                if let Some(instance) = workers.get_mut(name) {
                    if instance.generation == generation
                        && instance.state.status == WorkerStatus::Running
                    {
                        instance.state.tools = client.tools().to_vec();
                        instance.state.capabilities = true;
                        instance.client = Some(Arc::new(client));
                    }
                }
            }
            Err(e) => {
                warn!(server_name = %name, error = %e, "Capability negotiation failed, continuing without tools");
            }
        }

        let snapshot = self
            .inner
            .workers
            .read()
            .await
            .get(name)
            .map(|w| w.state.clone())
            .ok_or_else(|| SupervisorError::NotConfigured(name.to_string()))?;

        info!(
            server_name = %name,
            pid,
            tool_count = snapshot.tools.len(),
            "MCP server started"
        );
        self.inner
            .emitter
            .emit(McpEvent::server_started(name, pid, snapshot.tool_names()));

        Ok(snapshot)
    }

    async fn fail_start(
        &self,
        name: &str,
        generation: u64,
        info: McpErrorInfo,
        exit: Option<ExitInfo>,
    ) {
        {
            let mut workers = self.inner.workers.write().await;
            if let Some(instance) = workers.get_mut(name) {
                if instance.generation == generation {
                    instance.mark_error(info.message.clone(), exit);
                }
            }
        }
        self.inner.emitter.emit(McpEvent::server_error(info));
    }

    async fn stop_locked(&self, name: &str) {
        let teardown = {
            let mut workers = self.inner.workers.write().await;
            let Some(instance) = workers.get_mut(name) else {
                debug!(server_name = %name, "Stop requested for unknown server");
                return;
            };
            // Invalidates pending exit notifications and auto-restarts.
            instance.generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            instance.mark_stopped(None)
        };

        let exit = teardown.run().await;

        if let Some(exit) = exit {
            let mut workers = self.inner.workers.write().await;
            if let Some(instance) = workers.get_mut(name) {
                instance.state.last_exit = Some(exit);
            }
        }

        info!(server_name = %name, "MCP server stopped");
        self.inner
            .emitter
            .emit(McpEvent::server_stopped(name, exit));
    }

    /// React to a worker exiting on its own.
    async fn handle_exit(&self, name: String, generation: u64, exit: ExitInfo) {
        let lock = self.name_lock(&name);
        let _guard = lock.lock().await;

        let teardown = {
            let mut workers = self.inner.workers.write().await;
            match workers.get_mut(&name) {
                Some(instance)
                    if instance.generation == generation
                        && instance.state.status == WorkerStatus::Running =>
                {
                    instance.mark_stopped(Some(exit))
                }
                _ => {
                    debug!(server_name = %name, generation, "Ignoring stale exit notification");
                    return;
                }
            }
        };
        // The process is already reaped; this only releases the session.
        let _ = teardown.run().await;

        if exit.is_clean() {
            info!(server_name = %name, %exit, "MCP server exited");
        } else {
            warn!(server_name = %name, %exit, "MCP server exited unexpectedly");
        }
        self.inner
            .emitter
            .emit(McpEvent::server_stopped(&name, Some(exit)));

        if self.should_auto_restart(&name, exit) {
            let this = self.clone();
            let backoff = self.inner.options.restart_backoff;
            info!(server_name = %name, backoff_ms = backoff.as_millis(), "Scheduling auto-restart");
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                this.fire_auto_restart(name, generation).await;
            });
        }
    }

    fn should_auto_restart(&self, name: &str, exit: ExitInfo) -> bool {
        // A clean zero exit is never restarted, regardless of the global flag.
        self.inner.options.auto_restart
            && !exit.is_clean()
            && !self.is_shutting_down()
            && self.inner.config.snapshot().get_enabled(name).is_some()
    }

    async fn fire_auto_restart(&self, name: String, generation: u64) {
        if self.is_shutting_down() {
            debug!(server_name = %name, "Shutdown in progress, dropping auto-restart");
            return;
        }

        let lock = self.name_lock(&name);
        let _guard = lock.lock().await;

        let still_ours = self.inner.workers.read().await.get(&name).is_some_and(|w| {
            w.generation == generation && w.state.status == WorkerStatus::Stopped
        });
        if !still_ours || self.is_shutting_down() {
            debug!(server_name = %name, "Worker changed since exit, dropping auto-restart");
            return;
        }

        let Some(config) = self.inner.config.snapshot().get_enabled(&name).cloned() else {
            debug!(server_name = %name, "Entry no longer enabled, dropping auto-restart");
            return;
        };

        match self.start_locked(&name, config).await {
            Ok(_) => info!(server_name = %name, "Auto-restart succeeded"),
            // Spawn and startup failures were already reported as server_error.
            Err(e) => warn!(server_name = %name, error = %e, "Auto-restart failed"),
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Drop the per-name lock once no other task holds or waits on it.
    fn release_name_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .inner
            .name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Bring the registry in line with `target`.
    ///
    /// The plan is computed against the last reconciled snapshot; passes are
    /// serialized and the actions within a pass run concurrently.
    pub async fn reconcile(&self, target: Arc<ConfigSnapshot>) -> Vec<ReconcileAction> {
        let mut applied = self.inner.applied.lock().await;
        if self.is_shutting_down() {
            return Vec::new();
        }

        let actions = reconcile::plan(&applied, &target);
        if actions.is_empty() {
            debug!("Configuration change requires no worker changes");
        } else {
            info!(actions = ?actions, "Reconciling MCP servers");
        }

        join_all(actions.iter().map(|action| self.apply(action, &target))).await;
        *applied = target;
        actions
    }

    async fn apply(&self, action: &ReconcileAction, target: &ConfigSnapshot) {
        match action {
            ReconcileAction::Stop(name) => self.remove_server(name).await,
            ReconcileAction::Start(name) => {
                let Some(config) = target.get_enabled(name).cloned() else {
                    return;
                };
                if let Err(e) = self.start_server(name, config).await {
                    warn!(server_name = %name, error = %e, "Reconcile start failed");
                }
            }
            ReconcileAction::Restart(name) => {
                if let Err(e) = self.restart_server(name).await {
                    warn!(server_name = %name, error = %e, "Reconcile restart failed");
                }
            }
        }
    }

    /// Drive reconciliation from `config_changed` events until shutdown.
    pub fn spawn_reconciler(&self, mut rx: broadcast::Receiver<McpEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = this.inner.cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(McpEvent::ConfigChanged { new, .. }) => {
                        this.reconcile(new).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconciler lagged behind events, resyncing");
                        this.reconcile(this.inner.config.snapshot()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Reconciler stopped");
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_server(&self, name: &str) -> Option<WorkerSnapshot> {
        self.inner
            .workers
            .read()
            .await
            .get(name)
            .map(|w| w.state.clone())
    }

    /// All instances, ordered by name.
    pub async fn get_all_servers(&self) -> Vec<WorkerSnapshot> {
        let mut servers: Vec<WorkerSnapshot> = self
            .inner
            .workers
            .read()
            .await
            .values()
            .map(|w| w.state.clone())
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub async fn get_running_servers(&self) -> Vec<WorkerSnapshot> {
        let mut servers = self.get_all_servers().await;
        servers.retain(|s| s.status == WorkerStatus::Running);
        servers
    }

    pub async fn get_server_status(&self) -> BTreeMap<String, ServerStatusEntry> {
        let now = Utc::now();
        self.get_all_servers()
            .await
            .into_iter()
            .map(|s| (s.name.clone(), s.status_entry(now)))
            .collect()
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let snapshot = self.inner.config.snapshot();
        let servers: Vec<ServerStatusEntry> =
            self.get_server_status().await.into_values().collect();
        StatusSummary {
            total_configured: snapshot.len(),
            enabled: snapshot.enabled_count(),
            running: servers
                .iter()
                .filter(|s| s.status == WorkerStatus::Running)
                .count(),
            errored: servers
                .iter()
                .filter(|s| s.status == WorkerStatus::Error)
                .count(),
            servers,
        }
    }

    /// Tools of every running server that completed negotiation.
    pub async fn list_all_tools(&self) -> BTreeMap<String, Vec<McpTool>> {
        self.get_running_servers()
            .await
            .into_iter()
            .filter(|s| s.capabilities)
            .map(|s| (s.name, s.tools))
            .collect()
    }

    // ========================================================================
    // Tool invocation
    // ========================================================================

    /// Invoke `tool` on `server`. Locks are released before the call is sent.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ToolCallError> {
        let client = {
            let workers = self.inner.workers.read().await;
            let instance = workers
                .get(server)
                .ok_or_else(|| ToolCallError::ServerNotFound(server.to_string()))?;
            if instance.state.status != WorkerStatus::Running {
                return Err(ToolCallError::ServerNotRunning(server.to_string()));
            }
            instance
                .client
                .clone()
                .ok_or_else(|| ToolCallError::CapabilityUnavailable(server.to_string()))?
        };

        debug!(server_name = %server, tool, "Calling tool");
        client
            .call_tool(tool, arguments, self.inner.options.tool_call_timeout)
            .await
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("options", &self.inner.options)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Exit callback handed to the process monitor.
///
/// Holds only a weak reference so a dropped supervisor does not keep itself alive.
fn exit_callback(
    inner: Weak<Inner>,
    name: String,
    generation: u64,
) -> impl FnOnce(ExitInfo) + Send + 'static {
    move |exit| {
        tokio::spawn(dispatch_exit(inner, name, generation, exit));
    }
}

fn dispatch_exit(
    inner: Weak<Inner>,
    name: String,
    generation: u64,
    exit: ExitInfo,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            Supervisor { inner }.handle_exit(name, generation, exit).await;
        }
    })
}
