use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use regex::RegexBuilder;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{AgentEventKind, BusEvent, EventBus};
use crate::db;
use crate::models::{
    AgentRecord, AgentStatus, AgentTreeNode, RegistryStats, SpawnOptions, UpsertOptions,
};
use crate::ws::UiNotifier;

/// Repeated spawn detections for the same (session, name) inside this window
/// are coalesced into one record.
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

const ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const STALE_TERMINATE_INTERVAL: Duration = Duration::from_secs(300);
const STALE_PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const GARBAGE_PURGE_INTERVAL: Duration = Duration::from_secs(600);
const SESSION_VALIDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Active agents quiet for this long are demoted to idle.
const IDLE_AFTER_SECS: i64 = 120;
/// Non-terminal agents quiet for this long are presumed hung and terminated.
const STALE_TERMINATE_SECS: i64 = 30 * 60;
/// Records with no session correlation older than this are orphans.
const ORPHAN_MAX_AGE_SECS: i64 = 600;
/// Default age for purging terminal records.
pub const STALE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Built-in tool names. Detection sources occasionally report a tool
/// invocation as a sub-agent; records carrying these names are garbage.
pub const GARBAGE_TOOL_NAMES: &[&str] = &[
    "Task",
    "Bash",
    "Glob",
    "Grep",
    "Read",
    "Edit",
    "MultiEdit",
    "Write",
    "NotebookEdit",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "BashOutput",
    "KillShell",
    "ExitPlanMode",
];

/// True for an exact deny-list name or its `"<name> #<n>"` numbered variant.
/// Anything else, including close lookalikes, is a real agent name.
pub fn is_garbage_name(name: &str) -> bool {
    GARBAGE_TOOL_NAMES.iter().any(|tool| {
        name == *tool
            || name
                .strip_prefix(tool)
                .and_then(|rest| rest.strip_prefix(" #"))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

struct RegistryInner {
    agents: HashMap<String, AgentRecord>,
    /// session id -> agent id, populated from session:start events.
    session_agents: HashMap<String, String>,
    /// (session, name) -> last detection time, for the dedup window.
    recent_spawns: HashMap<String, Instant>,
}

/// Authoritative lifecycle state and hierarchy for every tracked agent.
///
/// All mutation goes through one mutex held for the whole operation, so no
/// two state changes interleave mid-flight; suspension happens only at the
/// persistence boundary.
pub struct AgentRegistry {
    pool: SqlitePool,
    bus: Option<EventBus>,
    notifier: UiNotifier,
    inner: Mutex<RegistryInner>,
    tasks: std::sync::Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl AgentRegistry {
    pub fn new(pool: SqlitePool, bus: Option<EventBus>, notifier: UiNotifier) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            notifier,
            inner: Mutex::new(RegistryInner {
                agents: HashMap::new(),
                session_agents: HashMap::new(),
                recent_spawns: HashMap::new(),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Load persisted agents, subscribe to the hook server's events, and
    /// start the maintenance timers.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let persisted = db::get_all_agents(&self.pool).await?;
        {
            let mut inner = self.inner.lock().await;
            for agent in persisted {
                inner.agents.insert(agent.id.clone(), agent);
            }
            info!(agents = inner.agents.len(), "registry loaded persisted agents");
        }

        match &self.bus {
            Some(bus) => {
                let mut rx = bus.subscribe();
                let registry = self.clone();
                let consumer = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                if let Err(e) = registry.handle_bus_event(event).await {
                                    warn!("registry event handling failed: {e:#}");
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("registry lagged by {n} bus events");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                self.store_task("bus-consumer", consumer);
            }
            None => {
                warn!("hook event bus unavailable; lifecycle inference disabled");
            }
        }

        self.spawn_sweep("activity-check", ACTIVITY_CHECK_INTERVAL, |r| async move {
            r.check_activity().await
        });
        self.spawn_sweep("stale-terminate", STALE_TERMINATE_INTERVAL, |r| async move {
            r.terminate_stale().await
        });
        self.spawn_sweep("stale-purge", STALE_PURGE_INTERVAL, |r| async move {
            r.cleanup_stale_agents(STALE_MAX_AGE).await.map(|_| ())
        });
        self.spawn_sweep("garbage-purge", GARBAGE_PURGE_INTERVAL, |r| async move {
            r.run_garbage_cleanup().await.map(|_| ())
        });
        self.spawn_sweep("session-validate", SESSION_VALIDATE_INTERVAL, |r| async move {
            r.validate_session_map().await;
            Ok(())
        });

        Ok(())
    }

    /// Cancel every owned background task.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        for (name, handle) in tasks.drain(..) {
            handle.abort();
            debug!(task = name, "registry task cancelled");
        }
        info!("registry shut down");
    }

    fn store_task(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .expect("task table poisoned")
            .push((name, handle));
    }

    fn spawn_sweep<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, sweep: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                // One failing sweep must never disable future sweeps.
                if let Err(e) = sweep(registry.clone()).await {
                    warn!(sweep = name, "maintenance sweep failed: {e:#}");
                }
            }
        });
        self.store_task(name, handle);
    }

    fn emit(&self, kind: AgentEventKind, agent: &AgentRecord) {
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::Agent {
                kind,
                agent: agent.clone(),
            });
        }
        let payload = serde_json::to_value(agent).unwrap_or(serde_json::Value::Null);
        self.notifier.push(kind.topic(), payload);
    }

    // ---- mutations ------------------------------------------------------

    pub async fn spawn(&self, opts: SpawnOptions) -> Result<AgentRecord> {
        let mut inner = self.inner.lock().await;
        let agent = self.spawn_locked(&mut inner, opts).await?;
        drop(inner);
        self.emit(AgentEventKind::Spawned, &agent);
        Ok(agent)
    }

    async fn spawn_locked(
        &self,
        inner: &mut RegistryInner,
        opts: SpawnOptions,
    ) -> Result<AgentRecord> {
        anyhow::ensure!(!opts.name.is_empty(), "spawn requires a name");
        anyhow::ensure!(!opts.cwd.is_empty(), "spawn requires a working directory");

        let now = Utc::now();
        let agent = AgentRecord {
            id: Uuid::new_v4().to_string(),
            name: opts.name,
            pid: None,
            cwd: opts.cwd,
            parent_id: opts.parent_id,
            template_id: opts.template_id,
            status: AgentStatus::Spawning,
            session_path: opts.session_path,
            initial_prompt: opts.initial_prompt,
            spawned_at: now,
            last_activity: now,
            completed_at: None,
            exit_code: None,
            error_message: None,
        };
        db::register_agent(&self.pool, &agent).await?;
        inner.agents.insert(agent.id.clone(), agent.clone());
        info!(id = %agent.id, name = %agent.name, "agent spawned");
        Ok(agent)
    }

    /// Attach the OS process id once it is known. Spawn may precede pid
    /// availability, so an unknown id is only a warning.
    pub async fn set_pid(&self, id: &str, pid: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, "set_pid: unknown agent");
            return Ok(());
        };
        agent.pid = Some(pid);
        let snapshot = agent.clone();
        db::save_agent(&self.pool, &snapshot).await?;
        Ok(())
    }

    pub async fn mark_ready(&self, id: &str) -> Result<()> {
        self.transition(id, AgentStatus::Ready, AgentEventKind::Ready)
            .await
    }

    pub async fn mark_active(&self, id: &str) -> Result<()> {
        self.transition(id, AgentStatus::Active, AgentEventKind::Active)
            .await
    }

    pub async fn mark_idle(&self, id: &str) -> Result<()> {
        self.transition(id, AgentStatus::Idle, AgentEventKind::Idle)
            .await
    }

    /// Idempotent transition helper: re-entering the current status only
    /// refreshes `last_activity` and emits nothing, so chatty agents cannot
    /// cause event storms.
    async fn transition(&self, id: &str, status: AgentStatus, kind: AgentEventKind) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, target = %status, "transition: unknown agent");
            return Ok(());
        };
        if agent.status.is_terminal() {
            warn!(id, current = %agent.status, target = %status, "transition on terminal agent ignored");
            return Ok(());
        }
        agent.last_activity = Utc::now();
        if agent.status == status {
            db::update_agent_activity(&self.pool, id).await?;
            return Ok(());
        }
        agent.status = status;
        let snapshot = agent.clone();
        db::update_agent_status(&self.pool, id, status).await?;
        drop(inner);
        self.emit(kind, &snapshot);
        Ok(())
    }

    /// Exit code zero completes the agent; anything else is an error.
    pub async fn complete(&self, id: &str, exit_code: i64) -> Result<()> {
        let (status, kind) = if exit_code == 0 {
            (AgentStatus::Completed, AgentEventKind::Completed)
        } else {
            (AgentStatus::Error, AgentEventKind::Error)
        };

        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, "complete: unknown agent");
            return Ok(());
        };
        if agent.status.is_terminal() {
            debug!(id, "complete on terminal agent ignored");
            return Ok(());
        }
        let now = Utc::now();
        agent.status = status;
        agent.exit_code = Some(exit_code);
        agent.completed_at = Some(now);
        agent.last_activity = now;
        let snapshot = agent.clone();
        db::complete_agent(&self.pool, id, status, Some(exit_code), None).await?;
        drop(inner);
        self.emit(kind, &snapshot);
        Ok(())
    }

    /// Force-transition into `error`. Always permitted; crashes race with
    /// everything.
    pub async fn error(&self, id: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, "error: unknown agent");
            return Ok(());
        };
        let now = Utc::now();
        agent.status = AgentStatus::Error;
        agent.error_message = Some(message.to_string());
        agent.completed_at = Some(now);
        agent.last_activity = now;
        let snapshot = agent.clone();
        db::complete_agent(&self.pool, id, AgentStatus::Error, None, Some(message)).await?;
        drop(inner);
        self.emit(AgentEventKind::Error, &snapshot);
        Ok(())
    }

    /// Force-stop. Purges the session lookup cache entry but deliberately
    /// leaves children's `parent_id` references intact.
    pub async fn terminate_agent(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, "terminate: unknown agent");
            return Ok(());
        };
        let now = Utc::now();
        agent.status = AgentStatus::Terminated;
        agent.completed_at = Some(now);
        agent.last_activity = now;
        let snapshot = agent.clone();
        inner.session_agents.retain(|_, agent_id| agent_id != id);
        db::complete_agent(&self.pool, id, AgentStatus::Terminated, None, None).await?;
        drop(inner);
        self.emit(AgentEventKind::Terminated, &snapshot);
        Ok(())
    }

    pub async fn record_activity(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(id) else {
            warn!(id, "record_activity: unknown agent");
            return Ok(());
        };
        agent.last_activity = Utc::now();
        let snapshot = agent.clone();
        db::update_agent_activity(&self.pool, id).await?;
        drop(inner);
        self.emit(AgentEventKind::Activity, &snapshot);
        Ok(())
    }

    /// Update-or-spawn keyed by `session_path`: the same underlying session
    /// reporting multiple start signals must never yield two live records.
    pub async fn upsert_agent(&self, opts: UpsertOptions) -> Result<AgentRecord> {
        let mut inner = self.inner.lock().await;

        let existing_id = opts.session_path.as_deref().and_then(|path| {
            inner
                .agents
                .values()
                .find(|a| !a.status.is_terminal() && a.session_path.as_deref() == Some(path))
                .map(|a| a.id.clone())
        });

        if let Some(id) = existing_id {
            let agent = inner.agents.get_mut(&id).expect("record just found");
            agent.name = opts.name;
            agent.cwd = opts.cwd;
            if opts.pid.is_some() {
                agent.pid = opts.pid;
            }
            if opts.parent_id.is_some() {
                agent.parent_id = opts.parent_id;
            }
            if opts.template_id.is_some() {
                agent.template_id = opts.template_id;
            }
            if opts.initial_prompt.is_some() {
                agent.initial_prompt = opts.initial_prompt;
            }
            let mut emit_kind = None;
            if let Some(status) = opts.status {
                if status != agent.status {
                    agent.status = status;
                    emit_kind = Some(kind_for_status(status));
                }
            }
            agent.last_activity = Utc::now();
            let snapshot = agent.clone();
            db::save_agent(&self.pool, &snapshot).await?;
            drop(inner);
            if let Some(kind) = emit_kind {
                self.emit(kind, &snapshot);
            }
            return Ok(snapshot);
        }

        let agent = self
            .spawn_locked(
                &mut inner,
                SpawnOptions {
                    name: opts.name,
                    cwd: opts.cwd,
                    parent_id: opts.parent_id,
                    template_id: opts.template_id,
                    initial_prompt: opts.initial_prompt,
                    session_path: opts.session_path,
                },
            )
            .await?;
        drop(inner);
        self.emit(AgentEventKind::Spawned, &agent);
        Ok(agent)
    }

    pub async fn clear_all_agents(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.agents.clear();
        inner.session_agents.clear();
        inner.recent_spawns.clear();
        let removed = db::delete_all_agents(&self.pool).await?;
        info!(removed, "cleared all agents");
        Ok(removed)
    }

    /// Remove tool invocations mistakenly registered as agents, plus aged
    /// orphans that never correlated to a session.
    pub async fn run_garbage_cleanup(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let orphan_cutoff = Utc::now() - chrono::Duration::seconds(ORPHAN_MAX_AGE_SECS);
        let garbage: Vec<String> = inner
            .agents
            .values()
            .filter(|a| {
                is_garbage_name(&a.name)
                    || (a.session_path.is_none()
                        && !a.status.is_terminal()
                        && a.spawned_at < orphan_cutoff)
            })
            .map(|a| a.id.clone())
            .collect();

        for id in &garbage {
            inner.agents.remove(id);
            inner.session_agents.retain(|_, agent_id| agent_id != id);
        }
        let removed = db::cleanup_garbage_agents(&self.pool, &garbage).await?;
        if removed > 0 {
            info!(removed, "garbage cleanup removed records");
        }
        Ok(removed)
    }

    /// Purge terminal records older than `max_age`.
    pub async fn cleanup_stale_agents(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut inner = self.inner.lock().await;
        inner
            .agents
            .retain(|_, a| !(a.status.is_terminal() && a.last_activity <= cutoff));
        let removed = db::cleanup_stale_agents(&self.pool, cutoff).await?;
        if removed > 0 {
            info!(removed, "stale cleanup removed records");
        }
        Ok(removed)
    }

    // ---- queries --------------------------------------------------------

    pub async fn get_agent(&self, id: &str) -> Option<AgentRecord> {
        self.inner.lock().await.agents.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.inner.lock().await.agents.contains_key(id)
    }

    pub async fn get_active_agents(&self) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<_> = inner
            .agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        agents
    }

    pub async fn get_all_agents(&self) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<_> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        agents
    }

    pub async fn get_children(&self, parent_id: &str) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        children_of(&inner.agents, parent_id)
    }

    pub async fn get_root_agents(&self) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        let mut roots: Vec<_> = inner
            .agents
            .values()
            .filter(|a| a.parent_id.is_none())
            .cloned()
            .collect();
        roots.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        roots
    }

    /// The full forest. An agent whose parent record no longer exists is
    /// shown as a root rather than dropped.
    pub async fn get_agent_tree(&self) -> Vec<AgentTreeNode> {
        let inner = self.inner.lock().await;
        let mut roots: Vec<_> = inner
            .agents
            .values()
            .filter(|a| {
                a.parent_id
                    .as_deref()
                    .map_or(true, |p| !inner.agents.contains_key(p))
            })
            .cloned()
            .collect();
        roots.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        roots
            .into_iter()
            .map(|agent| build_subtree(&inner.agents, agent, &mut HashSet::new()))
            .collect()
    }

    pub async fn get_subtree(&self, id: &str) -> Option<AgentTreeNode> {
        let inner = self.inner.lock().await;
        let agent = inner.agents.get(id).cloned()?;
        Some(build_subtree(&inner.agents, agent, &mut HashSet::new()))
    }

    /// Chain of parents, nearest first. Empty for roots; stops at the first
    /// reference that no longer resolves.
    pub async fn get_ancestors(&self, id: &str) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        let mut ancestors = Vec::new();
        let mut seen = HashSet::new();
        let mut current = inner.agents.get(id).and_then(|a| a.parent_id.clone());
        while let Some(parent_id) = current {
            if !seen.insert(parent_id.clone()) {
                break;
            }
            match inner.agents.get(&parent_id) {
                Some(parent) => {
                    ancestors.push(parent.clone());
                    current = parent.parent_id.clone();
                }
                None => break,
            }
        }
        ancestors
    }

    /// Complete subtree below `id`, breadth-first, at any depth.
    pub async fn get_descendants(&self, id: &str) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for child in children_of(&inner.agents, &current) {
                if seen.insert(child.id.clone()) {
                    queue.push_back(child.id.clone());
                    out.push(child);
                }
            }
        }
        out
    }

    pub async fn get_agents_by_status(&self, status: AgentStatus) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    /// Case-insensitive name search. The pattern is a regular expression; an
    /// invalid pattern degrades to a substring match.
    pub async fn find_agents_by_name(&self, pattern: &str) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => inner
                .agents
                .values()
                .filter(|a| re.is_match(&a.name))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(pattern, "invalid name pattern ({e}); matching as substring");
                let needle = pattern.to_lowercase();
                inner
                    .agents
                    .values()
                    .filter(|a| a.name.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Session lookup: in-memory cache first, persisted store second.
    pub async fn get_agent_by_session(&self, session_id: &str) -> Option<AgentRecord> {
        {
            let inner = self.inner.lock().await;
            if let Some(agent_id) = inner.session_agents.get(session_id) {
                if let Some(agent) = inner.agents.get(agent_id) {
                    return Some(agent.clone());
                }
            }
        }
        match db::find_agent_by_session(&self.pool, session_id).await {
            Ok(Some(agent)) => {
                let mut inner = self.inner.lock().await;
                inner
                    .session_agents
                    .insert(session_id.to_string(), agent.id.clone());
                Some(agent)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id, "session lookup failed: {e:#}");
                None
            }
        }
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for agent in inner.agents.values() {
            *by_status.entry(agent.status.to_string()).or_default() += 1;
        }
        let count = |s: AgentStatus| by_status.get(s.as_str()).copied().unwrap_or(0);
        RegistryStats {
            total: inner.agents.len(),
            active: count(AgentStatus::Spawning)
                + count(AgentStatus::Ready)
                + count(AgentStatus::Active),
            idle: count(AgentStatus::Idle),
            completed: count(AgentStatus::Completed),
            error: count(AgentStatus::Error),
            by_status,
        }
    }

    // ---- hook-server integration ---------------------------------------

    pub(crate) async fn handle_bus_event(&self, event: BusEvent) -> Result<()> {
        match event {
            BusEvent::SessionStart {
                session_id,
                cwd,
                parent_session_id,
                transcript_path,
            } => {
                self.on_session_start(session_id, cwd, parent_session_id, transcript_path)
                    .await
            }
            BusEvent::SessionEnd { session_id, .. } => {
                let mut inner = self.inner.lock().await;
                inner.session_agents.remove(&session_id);
                Ok(())
            }
            BusEvent::AgentStart {
                session_id,
                cwd,
                name,
                prompt,
            } => self.on_agent_start(session_id, cwd, name, prompt).await,
            BusEvent::AgentStop { session_id, name } => {
                self.on_agent_stop(session_id, name).await
            }
            BusEvent::HookProcessed { event, .. } => self.on_hook_processed(event).await,
            // Our own emissions come back around on the shared bus.
            BusEvent::Agent { .. } => Ok(()),
        }
    }

    /// Correlate a starting session with a tracked agent and cache the
    /// mapping. A session with no matching record is someone else's CLI.
    /// Nested sessions carry the parent session id resolved by the hook
    /// server; when that resolves to a live agent, the correlated record is
    /// attached under it.
    async fn on_session_start(
        &self,
        session_id: String,
        cwd: String,
        parent_session_id: Option<String>,
        transcript_path: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let matched = inner
            .agents
            .values()
            .find(|a| {
                !a.status.is_terminal()
                    && transcript_path.is_some()
                    && a.session_path == transcript_path
            })
            .or_else(|| {
                inner
                    .agents
                    .values()
                    .find(|a| a.status == AgentStatus::Spawning && a.cwd == cwd)
            })
            .map(|a| a.id.clone());

        let Some(agent_id) = matched else {
            debug!(session_id, "session start with no tracked agent");
            return Ok(());
        };

        inner
            .session_agents
            .insert(session_id.clone(), agent_id.clone());

        let parent_agent_id = parent_session_id
            .as_deref()
            .and_then(|parent| inner.session_agents.get(parent).cloned())
            .filter(|pid| {
                pid != &agent_id
                    && inner
                        .agents
                        .get(pid)
                        .is_some_and(|p| !p.status.is_terminal())
            });

        let agent = inner.agents.get_mut(&agent_id).expect("record just found");
        let mut dirty = false;
        if agent.session_path.is_none() {
            if let Some(path) = transcript_path {
                agent.session_path = Some(path);
                dirty = true;
            }
        }
        if agent.parent_id.is_none() {
            if let Some(parent_id) = parent_agent_id {
                agent.parent_id = Some(parent_id);
                dirty = true;
            }
        }
        // Duplicated session starts must not walk an active agent back.
        let promote = agent.status == AgentStatus::Spawning;
        if dirty {
            let snapshot = agent.clone();
            db::save_agent(&self.pool, &snapshot).await?;
        }
        drop(inner);
        if promote {
            self.mark_ready(&agent_id).await?;
        }
        Ok(())
    }

    /// A spawn detection. Noisy sources fire repeatedly, so coalesce within
    /// the dedup window, then spawn or re-activate.
    async fn on_agent_start(
        &self,
        session_id: String,
        cwd: String,
        name: String,
        prompt: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let dedup_key = format!("{session_id}:{name}");
        let now = Instant::now();
        inner
            .recent_spawns
            .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
        if inner.recent_spawns.contains_key(&dedup_key) {
            debug!(session_id, name, "duplicate spawn detection suppressed");
            return Ok(());
        }
        inner.recent_spawns.insert(dedup_key, now);

        let parent_id = inner.session_agents.get(&session_id).cloned();
        let existing = inner
            .agents
            .values()
            .find(|a| !a.status.is_terminal() && a.name == name && a.parent_id == parent_id)
            .map(|a| a.id.clone());

        let agent_id = match existing {
            Some(id) => id,
            None => {
                let agent = self
                    .spawn_locked(
                        &mut inner,
                        SpawnOptions {
                            name,
                            cwd,
                            parent_id,
                            template_id: None,
                            initial_prompt: prompt,
                            session_path: None,
                        },
                    )
                    .await?;
                let id = agent.id.clone();
                drop(inner);
                self.emit(AgentEventKind::Spawned, &agent);
                self.mark_active(&id).await?;
                return Ok(());
            }
        };
        drop(inner);
        self.mark_active(&agent_id).await
    }

    /// A stop detection: complete the most recent live sub-agent under the
    /// reporting session, by name when one was given.
    async fn on_agent_stop(&self, session_id: String, name: Option<String>) -> Result<()> {
        let inner = self.inner.lock().await;
        let parent_id = inner.session_agents.get(&session_id).cloned();
        let target = inner
            .agents
            .values()
            .filter(|a| !a.status.is_terminal() && a.parent_id == parent_id && a.parent_id.is_some())
            .filter(|a| name.as_deref().map_or(true, |n| a.name == n))
            .max_by_key(|a| a.spawned_at)
            .map(|a| a.id.clone());
        drop(inner);

        match target {
            Some(id) => self.complete(&id, 0).await,
            None => {
                debug!(session_id, "agent stop with no live sub-agent");
                Ok(())
            }
        }
    }

    /// Coarse activity inference from the processed hook stream: prompts and
    /// tool use mean the session's agent is working, Stop means the turn ended.
    async fn on_hook_processed(&self, event: crate::models::HookEvent) -> Result<()> {
        if event.session_id.is_empty() {
            return Ok(());
        }
        let agent = {
            let inner = self.inner.lock().await;
            inner
                .session_agents
                .get(&event.session_id)
                .and_then(|id| inner.agents.get(id))
                .map(|a| (a.id.clone(), a.status))
        };
        let Some((id, status)) = agent else {
            return Ok(());
        };

        match event.event_type.as_str() {
            "Stop" => self.mark_idle(&id).await,
            "UserPromptSubmit" | "PreToolUse" | "PostToolUse" => {
                if matches!(status, AgentStatus::Ready | AgentStatus::Idle) {
                    self.mark_active(&id).await
                } else {
                    self.record_activity(&id).await
                }
            }
            _ => Ok(()),
        }
    }

    // ---- maintenance sweeps ---------------------------------------------

    /// Demote active agents that have gone quiet.
    async fn check_activity(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(IDLE_AFTER_SECS);
        let stale: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .agents
                .values()
                .filter(|a| a.status == AgentStatus::Active && a.last_activity < cutoff)
                .map(|a| a.id.clone())
                .collect()
        };
        for id in stale {
            self.mark_idle(&id).await?;
        }
        Ok(())
    }

    /// Force-terminate agents inactive long enough to be presumed hung.
    async fn terminate_stale(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(STALE_TERMINATE_SECS);
        let hung: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .agents
                .values()
                .filter(|a| !a.status.is_terminal() && a.last_activity < cutoff)
                .map(|a| a.id.clone())
                .collect()
        };
        for id in hung {
            warn!(id, "terminating agent presumed hung");
            self.terminate_agent(&id).await?;
        }
        Ok(())
    }

    /// Drop cache entries whose agent left a non-terminal state.
    async fn validate_session_map(&self) {
        let mut inner = self.inner.lock().await;
        let RegistryInner {
            agents,
            session_agents,
            ..
        } = &mut *inner;
        session_agents.retain(|_, id| agents.get(id).is_some_and(|a| !a.status.is_terminal()));
    }
}

fn children_of(agents: &HashMap<String, AgentRecord>, parent_id: &str) -> Vec<AgentRecord> {
    let mut children: Vec<_> = agents
        .values()
        .filter(|a| a.parent_id.as_deref() == Some(parent_id))
        .cloned()
        .collect();
    children.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
    children
}

fn build_subtree(
    agents: &HashMap<String, AgentRecord>,
    agent: AgentRecord,
    visited: &mut HashSet<String>,
) -> AgentTreeNode {
    let children = if visited.insert(agent.id.clone()) {
        children_of(agents, &agent.id)
            .into_iter()
            .map(|child| build_subtree(agents, child, visited))
            .collect()
    } else {
        Vec::new()
    };
    AgentTreeNode { agent, children }
}

fn kind_for_status(status: AgentStatus) -> AgentEventKind {
    match status {
        AgentStatus::Spawning => AgentEventKind::Spawned,
        AgentStatus::Ready => AgentEventKind::Ready,
        AgentStatus::Active => AgentEventKind::Active,
        AgentStatus::Idle => AgentEventKind::Idle,
        AgentStatus::Completed => AgentEventKind::Completed,
        AgentStatus::Error => AgentEventKind::Error,
        AgentStatus::Terminated => AgentEventKind::Terminated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn registry() -> (Arc<AgentRegistry>, EventBus) {
        let pool = db::memory_pool().await;
        let bus = EventBus::new();
        let registry = AgentRegistry::new(pool, Some(bus.clone()), UiNotifier::new());
        (registry, bus)
    }

    fn opts(name: &str) -> SpawnOptions {
        SpawnOptions {
            name: name.to_string(),
            cwd: "/p".to_string(),
            ..Default::default()
        }
    }

    fn drain_agent_events(
        rx: &mut tokio::sync::broadcast::Receiver<BusEvent>,
    ) -> Vec<AgentEventKind> {
        let mut kinds = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(BusEvent::Agent { kind, .. }) => kinds.push(kind),
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        kinds
    }

    #[tokio::test]
    async fn full_lifecycle_completes_with_exit_zero() {
        let (registry, _bus) = registry().await;
        let agent = registry.spawn(opts("worker")).await.unwrap();

        registry.mark_ready(&agent.id).await.unwrap();
        registry.mark_active(&agent.id).await.unwrap();
        registry.complete(&agent.id, 0).await.unwrap();

        let finished = registry.get_agent(&agent.id).await.unwrap();
        assert_eq!(finished.status, AgentStatus::Completed);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let (registry, _bus) = registry().await;
        let agent = registry.spawn(opts("worker")).await.unwrap();
        registry.complete(&agent.id, 3).await.unwrap();

        let finished = registry.get_agent(&agent.id).await.unwrap();
        assert_eq!(finished.status, AgentStatus::Error);
        assert_eq!(finished.exit_code, Some(3));
    }

    #[tokio::test]
    async fn repeated_mark_active_emits_once() {
        let (registry, bus) = registry().await;
        let agent = registry.spawn(opts("worker")).await.unwrap();
        let mut rx = bus.subscribe();

        registry.mark_active(&agent.id).await.unwrap();
        registry.mark_active(&agent.id).await.unwrap();

        let actives = drain_agent_events(&mut rx)
            .into_iter()
            .filter(|k| *k == AgentEventKind::Active)
            .count();
        assert_eq!(actives, 1);
    }

    #[tokio::test]
    async fn unknown_id_mutations_are_noops() {
        let (registry, _bus) = registry().await;
        registry.mark_active("missing").await.unwrap();
        registry.complete("missing", 0).await.unwrap();
        registry.set_pid("missing", 1234).await.unwrap();
        registry.error("missing", "gone").await.unwrap();
        registry.terminate_agent("missing").await.unwrap();
        registry.record_activity("missing").await.unwrap();
    }

    #[tokio::test]
    async fn terminated_parent_keeps_its_children() {
        let (registry, _bus) = registry().await;
        let a = registry.spawn(opts("A")).await.unwrap();
        let b = registry
            .spawn(SpawnOptions {
                parent_id: Some(a.id.clone()),
                ..opts("B")
            })
            .await
            .unwrap();

        let children = registry.get_children(&a.id).await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, b.id);

        registry.terminate_agent(&a.id).await.unwrap();
        assert_eq!(
            registry.get_agent(&a.id).await.unwrap().status,
            AgentStatus::Terminated
        );

        let children = registry.get_children(&a.id).await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, b.id);
    }

    #[tokio::test]
    async fn ancestors_are_nearest_first_and_descendants_are_deep() {
        let (registry, _bus) = registry().await;
        let root = registry.spawn(opts("root")).await.unwrap();
        let mid = registry
            .spawn(SpawnOptions {
                parent_id: Some(root.id.clone()),
                ..opts("mid")
            })
            .await
            .unwrap();
        let leaf = registry
            .spawn(SpawnOptions {
                parent_id: Some(mid.id.clone()),
                ..opts("leaf")
            })
            .await
            .unwrap();

        let ancestors = registry.get_ancestors(&leaf.id).await;
        assert_eq!(
            ancestors.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            vec![mid.id.as_str(), root.id.as_str()]
        );
        assert!(registry.get_ancestors(&root.id).await.is_empty());

        let descendants = registry.get_descendants(&root.id).await;
        let mut ids: Vec<_> = descendants.iter().map(|a| a.id.as_str()).collect();
        ids.sort();
        let mut expected = vec![mid.id.as_str(), leaf.id.as_str()];
        expected.sort();
        assert_eq!(ids, expected);

        let subtree = registry.get_subtree(&root.id).await.unwrap();
        assert_eq!(subtree.children.len(), 1);
        assert_eq!(subtree.children[0].children.len(), 1);
    }

    #[tokio::test]
    async fn tree_shows_orphaned_children_as_roots() {
        let (registry, _bus) = registry().await;
        let child = registry
            .spawn(SpawnOptions {
                parent_id: Some("long-gone".to_string()),
                ..opts("orphan")
            })
            .await
            .unwrap();

        let tree = registry.get_agent_tree().await;
        assert!(tree.iter().any(|node| node.agent.id == child.id));
        assert!(registry.get_ancestors(&child.id).await.is_empty());
    }

    #[tokio::test]
    async fn upsert_never_duplicates_a_live_session() {
        let (registry, _bus) = registry().await;
        let first = registry
            .upsert_agent(UpsertOptions {
                name: "primary".to_string(),
                cwd: "/p".to_string(),
                session_path: Some("/tmp/s1.jsonl".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let second = registry
            .upsert_agent(UpsertOptions {
                name: "primary-renamed".to_string(),
                cwd: "/p".to_string(),
                pid: Some(42),
                session_path: Some("/tmp/s1.jsonl".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "primary-renamed");
        assert_eq!(second.pid, Some(42));

        let live: Vec<_> = registry
            .get_active_agents()
            .await
            .into_iter()
            .filter(|a| a.session_path.as_deref() == Some("/tmp/s1.jsonl"))
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn upsert_spawns_fresh_after_previous_terminated() {
        let (registry, _bus) = registry().await;
        let first = registry
            .upsert_agent(UpsertOptions {
                name: "primary".to_string(),
                cwd: "/p".to_string(),
                session_path: Some("/tmp/s1.jsonl".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        registry.terminate_agent(&first.id).await.unwrap();

        let second = registry
            .upsert_agent(UpsertOptions {
                name: "primary".to_string(),
                cwd: "/p".to_string(),
                session_path: Some("/tmp/s1.jsonl".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn garbage_cleanup_removes_tool_names_only() {
        let (registry, _bus) = registry().await;
        registry.spawn(opts("Read")).await.unwrap();
        registry.spawn(opts("Bash #3")).await.unwrap();
        let keep = registry.spawn(opts("MyAgent")).await.unwrap();
        let keep2 = registry.spawn(opts("Reader")).await.unwrap();

        let removed = registry.run_garbage_cleanup().await.unwrap();
        assert_eq!(removed, 2);
        assert!(registry.exists(&keep.id).await);
        assert!(registry.exists(&keep2.id).await);
        assert!(registry.find_agents_by_name("^Read$").await.is_empty());
    }

    #[test]
    fn garbage_name_matching_is_exact() {
        assert!(is_garbage_name("Read"));
        assert!(is_garbage_name("Bash #3"));
        assert!(is_garbage_name("WebFetch #12"));
        assert!(!is_garbage_name("MyAgent"));
        assert!(!is_garbage_name("Reader"));
        assert!(!is_garbage_name("Bash #"));
        assert!(!is_garbage_name("Bash #x"));
        assert!(!is_garbage_name("bash"));
    }

    #[tokio::test]
    async fn fresh_orphans_survive_garbage_cleanup() {
        let (registry, _bus) = registry().await;
        let orphan = registry.spawn(opts("unborn")).await.unwrap();
        assert!(orphan.session_path.is_none());

        registry.run_garbage_cleanup().await.unwrap();
        assert!(registry.exists(&orphan.id).await);
    }

    #[tokio::test]
    async fn find_agents_by_name_is_case_insensitive_regex() {
        let (registry, _bus) = registry().await;
        registry.spawn(opts("Code-Reviewer")).await.unwrap();
        registry.spawn(opts("test-runner")).await.unwrap();

        assert_eq!(registry.find_agents_by_name("reviewer").await.len(), 1);
        assert_eq!(registry.find_agents_by_name("^code-.*$").await.len(), 1);
        assert_eq!(registry.find_agents_by_name(".*").await.len(), 2);
        // Invalid regex degrades to substring matching.
        assert_eq!(registry.find_agents_by_name("runner(").await.len(), 0);
        registry.spawn(opts("weird( name")).await.unwrap();
        assert_eq!(registry.find_agents_by_name("weird(").await.len(), 1);
    }

    #[tokio::test]
    async fn stats_group_statuses() {
        let (registry, _bus) = registry().await;
        let a = registry.spawn(opts("a")).await.unwrap();
        let b = registry.spawn(opts("b")).await.unwrap();
        let c = registry.spawn(opts("c")).await.unwrap();
        registry.mark_ready(&a.id).await.unwrap();
        registry.mark_active(&a.id).await.unwrap();
        registry.mark_idle(&b.id).await.unwrap();
        registry.complete(&c.id, 0).await.unwrap();

        let stats = registry.get_stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1); // spawning + ready + active
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.by_status.get("active"), Some(&1));
    }

    #[tokio::test]
    async fn clear_all_agents_reports_count() {
        let (registry, _bus) = registry().await;
        registry.spawn(opts("a")).await.unwrap();
        registry.spawn(opts("b")).await.unwrap();
        assert_eq!(registry.clear_all_agents().await.unwrap(), 2);
        assert!(registry.get_all_agents().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_spawn_detections_are_coalesced() {
        let (registry, _bus) = registry().await;
        for _ in 0..2 {
            registry
                .handle_bus_event(BusEvent::AgentStart {
                    session_id: "sess-1".to_string(),
                    cwd: "/p".to_string(),
                    name: "reviewer".to_string(),
                    prompt: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(registry.find_agents_by_name("^reviewer$").await.len(), 1);
    }

    #[tokio::test]
    async fn session_start_correlates_and_readies_the_agent() {
        let (registry, _bus) = registry().await;
        let agent = registry
            .spawn(SpawnOptions {
                session_path: Some("/tmp/sess-9.jsonl".to_string()),
                ..opts("primary")
            })
            .await
            .unwrap();

        registry
            .handle_bus_event(BusEvent::SessionStart {
                session_id: "sess-9".to_string(),
                cwd: "/p".to_string(),
                parent_session_id: None,
                transcript_path: Some("/tmp/sess-9.jsonl".to_string()),
            })
            .await
            .unwrap();

        let found = registry.get_agent_by_session("sess-9").await.unwrap();
        assert_eq!(found.id, agent.id);
        assert_eq!(found.status, AgentStatus::Ready);

        registry
            .handle_bus_event(BusEvent::SessionEnd {
                session_id: "sess-9".to_string(),
                cwd: "/p".to_string(),
            })
            .await
            .unwrap();
        // Cache invalidated; the persisted fallback still resolves it.
        let found = registry.get_agent_by_session("sess-9").await.unwrap();
        assert_eq!(found.id, agent.id);
    }

    #[tokio::test]
    async fn nested_session_start_attaches_the_parent_agent() {
        let (registry, _bus) = registry().await;
        let outer = registry
            .spawn(SpawnOptions {
                session_path: Some("/tmp/outer-sess.jsonl".to_string()),
                ..opts("outer")
            })
            .await
            .unwrap();
        registry
            .handle_bus_event(BusEvent::SessionStart {
                session_id: "outer-sess".to_string(),
                cwd: "/p".to_string(),
                parent_session_id: None,
                transcript_path: Some("/tmp/outer-sess.jsonl".to_string()),
            })
            .await
            .unwrap();

        let inner = registry
            .spawn(SpawnOptions {
                session_path: Some("/tmp/inner-sess.jsonl".to_string()),
                ..opts("inner")
            })
            .await
            .unwrap();
        registry
            .handle_bus_event(BusEvent::SessionStart {
                session_id: "inner-sess".to_string(),
                cwd: "/p".to_string(),
                parent_session_id: Some("outer-sess".to_string()),
                transcript_path: Some("/tmp/inner-sess.jsonl".to_string()),
            })
            .await
            .unwrap();

        let nested = registry.get_agent(&inner.id).await.unwrap();
        assert_eq!(nested.parent_id.as_deref(), Some(outer.id.as_str()));

        let ancestors = registry.get_ancestors(&inner.id).await;
        assert_eq!(ancestors.len(), 1);
        assert_eq!(ancestors[0].id, outer.id);

        let tree = registry.get_agent_tree().await;
        let root = tree.iter().find(|n| n.agent.id == outer.id).unwrap();
        assert!(root.children.iter().any(|n| n.agent.id == inner.id));
    }

    #[tokio::test]
    async fn duplicate_session_start_does_not_demote_the_agent() {
        let (registry, _bus) = registry().await;
        let agent = registry
            .spawn(SpawnOptions {
                session_path: Some("/tmp/sess-11.jsonl".to_string()),
                ..opts("primary")
            })
            .await
            .unwrap();
        let start = BusEvent::SessionStart {
            session_id: "sess-11".to_string(),
            cwd: "/p".to_string(),
            parent_session_id: None,
            transcript_path: Some("/tmp/sess-11.jsonl".to_string()),
        };

        registry.handle_bus_event(start.clone()).await.unwrap();
        assert_eq!(
            registry.get_agent(&agent.id).await.unwrap().status,
            AgentStatus::Ready
        );

        registry.mark_active(&agent.id).await.unwrap();
        registry.handle_bus_event(start).await.unwrap();
        assert_eq!(
            registry.get_agent(&agent.id).await.unwrap().status,
            AgentStatus::Active
        );
    }

    #[tokio::test]
    async fn sub_agent_lifecycle_from_detection_events() {
        let (registry, _bus) = registry().await;
        let primary = registry
            .spawn(SpawnOptions {
                session_path: Some("/tmp/t-7.jsonl".to_string()),
                ..opts("primary")
            })
            .await
            .unwrap();
        registry
            .handle_bus_event(BusEvent::SessionStart {
                session_id: "sess-7".to_string(),
                cwd: "/p".to_string(),
                parent_session_id: None,
                transcript_path: Some("/tmp/t-7.jsonl".to_string()),
            })
            .await
            .unwrap();

        registry
            .handle_bus_event(BusEvent::AgentStart {
                session_id: "sess-7".to_string(),
                cwd: "/p".to_string(),
                name: "reviewer".to_string(),
                prompt: Some("review".to_string()),
            })
            .await
            .unwrap();

        let children = registry.get_children(&primary.id).await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "reviewer");
        assert_eq!(children[0].status, AgentStatus::Active);

        registry
            .handle_bus_event(BusEvent::AgentStop {
                session_id: "sess-7".to_string(),
                name: Some("reviewer".to_string()),
            })
            .await
            .unwrap();

        let children = registry.get_children(&primary.id).await;
        assert_eq!(children[0].status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn stale_terminal_records_are_purged() {
        let (registry, _bus) = registry().await;
        let agent = registry.spawn(opts("old")).await.unwrap();
        registry.complete(&agent.id, 0).await.unwrap();

        // Zero max age: everything terminal is stale.
        let removed = registry.cleanup_stale_agents(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!registry.exists(&agent.id).await);
    }

    #[tokio::test]
    async fn init_restores_persisted_agents() {
        let pool = db::memory_pool().await;
        let bus = EventBus::new();
        let registry = AgentRegistry::new(pool.clone(), Some(bus.clone()), UiNotifier::new());
        let agent = registry.spawn(opts("survivor")).await.unwrap();

        let restored = AgentRegistry::new(pool, Some(bus), UiNotifier::new());
        restored.init().await.unwrap();
        assert!(restored.exists(&agent.id).await);
        restored.shutdown();
    }
}
