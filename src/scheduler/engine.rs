//! 调度引擎
//!
//! 生命周期：`load_config → start → run(cancel) → stop`。
//! - 注册表与全局设置只经热更新路径写入，tick 读取不可变快照
//! - 每个 tick 按优先级评估 agent：触发器 → 全局闸门 → 锁 → 启动
//! - 每次运行是独立的 tokio 任务 + 子进程，结束后释放锁、更新统计
//! - 所有状态迁移都写审计，单个 agent 的失败不影响其它 agent

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditCategory, AuditEvent, AuditLevel, AuditSink};
use crate::core::shutdown::ShutdownCleanup;
use crate::scheduler::activity::{ActivitySource, FixedActivity};
use crate::scheduler::launcher::{AgentLauncher, LaunchError};
use crate::scheduler::lock::{AcquireOutcome, LockManager, LockToken};
use crate::scheduler::spec::{load_config_file, AgentSpec, ConfigError, GlobalSettings, SchedulerConfig};
use crate::scheduler::state::{
    AgentPhase, AgentRunStats, PersistedAgent, PersistedState, RunningEntry, RunningRegistry,
    StateStore,
};
use crate::scheduler::trigger::{apply_gates, should_fire, GateVeto, RunningCounts, TriggerState};
use crate::scheduler::watcher::ConfigChanged;

/// 时钟；`now()` 的偏移量决定 TimeOfDay 与静默时段使用的本地时间
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// 手动推进的时钟（UTC），测试用
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.now.lock().unwrap_or_else(|p| p.into_inner()).fixed_offset()
    }
}

/// 每个 tick 结束时调用（审批过期等维护任务）
pub trait TickHook: Send + Sync {
    fn on_tick(&self, now: DateTime<Utc>);
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// agents.json；None 时只能通过 load_config 传入配置
    pub agents_file: Option<PathBuf>,
    /// scheduler-state.json / running.json 所在目录；None 时不持久化
    pub state_dir: Option<PathBuf>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            agents_file: None,
            state_dir: None,
        }
    }
}

/// 第 `attempt` 次连续失败后的重试延迟：base * 2^(attempt-1)，不超过 max
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(20);
    base.saturating_mul(factor).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireReason {
    Manual,
    Retry,
    Trigger,
}

impl FireReason {
    fn as_str(&self) -> &'static str {
        match self {
            FireReason::Manual => "manual",
            FireReason::Retry => "retry",
            FireReason::Trigger => "trigger",
        }
    }
}

struct AgentEntry {
    spec: AgentSpec,
    trigger: TriggerState,
    phase: AgentPhase,
    stats: AgentRunStats,
    consecutive_failures: u32,
    retry_at: Option<DateTime<Utc>>,
    /// 运行时副本：重试耗尽后置 false，不回写配置文件
    auto_restart: bool,
    manual_pending: bool,
    last_veto: Option<GateVeto>,
}

impl AgentEntry {
    fn new(spec: AgentSpec, trigger: TriggerState, stats: AgentRunStats) -> Self {
        Self {
            auto_restart: spec.auto_restart,
            spec,
            trigger,
            phase: AgentPhase::Idle,
            stats,
            consecutive_failures: 0,
            retry_at: None,
            manual_pending: false,
            last_veto: None,
        }
    }
}

struct RunningInfo {
    uses_llm: bool,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    token: LockToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, AgentEntry>,
    running: HashMap<String, RunningInfo>,
    /// 上次进程留下的持久化状态，agent 注册时取用
    restored: BTreeMap<String, PersistedAgent>,
}

impl Inner {
    fn counts(&self) -> RunningCounts {
        let mut counts = RunningCounts::default();
        for info in self.running.values() {
            counts.add(info.uses_llm);
        }
        counts
    }
}

/// 单次 tick 的结果
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub fired: Vec<String>,
    /// (agent, 原因)
    pub skipped: Vec<(String, String)>,
}

/// 热更新 diff 结果
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// 触发器类型改变、触发状态被重置的 agent
    pub reset: Vec<String>,
}

/// `hive stats` / 测试查看的 agent 状态
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: String,
    pub enabled: bool,
    pub trigger: String,
    pub phase: AgentPhase,
    pub stats: AgentRunStats,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub auto_restart: bool,
    pub pid: Option<u32>,
}

pub struct Scheduler {
    options: SchedulerOptions,
    locks: Arc<LockManager>,
    launcher: Arc<dyn AgentLauncher>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    activity: Arc<dyn ActivitySource>,
    hooks: Vec<Arc<dyn TickHook>>,
    state_store: Option<StateStore>,
    running_registry: Option<RunningRegistry>,
    config: RwLock<Arc<SchedulerConfig>>,
    inner: Mutex<Inner>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    idle: Notify,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        locks: Arc<LockManager>,
        launcher: Arc<dyn AgentLauncher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let state_store = options
            .state_dir
            .as_ref()
            .map(|dir| StateStore::new(dir.join("scheduler-state.json")));
        let running_registry = options
            .state_dir
            .as_ref()
            .map(|dir| RunningRegistry::new(dir.join("running.json")));
        let restored = state_store
            .as_ref()
            .map(|s| s.load().agents)
            .unwrap_or_default();

        Self {
            options,
            locks,
            launcher,
            audit,
            clock: Arc::new(SystemClock),
            activity: Arc::new(FixedActivity::new(0)),
            hooks: Vec::new(),
            state_store,
            running_registry,
            config: RwLock::new(Arc::new(SchedulerConfig::default())),
            inner: Mutex::new(Inner {
                restored,
                ..Default::default()
            }),
            tasks: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_activity(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TickHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// 当前配置快照
    pub fn snapshot(&self) -> Arc<SchedulerConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, category: AuditCategory, event: &str, level: AuditLevel, details: Value) {
        self.audit.audit(
            AuditEvent::new(category, event)
                .level(level)
                .details(details)
                .actor("scheduler"),
        );
    }

    fn transition(&self, entry: &mut AgentEntry, to: AgentPhase, extra: Value) {
        let from = entry.phase;
        entry.phase = to;
        tracing::debug!(agent = %entry.spec.id, from = from.as_str(), to = to.as_str(), "Agent transition");
        let mut details = json!({
            "agent": entry.spec.id,
            "from": from.as_str(),
            "to": to.as_str(),
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut details, extra) {
            map.extend(extra);
        }
        self.emit(AuditCategory::Scheduler, "agent_transition", AuditLevel::Info, details);
    }

    /// 应用一份新配置（首次加载与热更新共用）
    pub fn load_config(&self, config: SchedulerConfig) -> ReloadReport {
        let report = self.apply_config(config);
        self.persist();
        report
    }

    /// 从 agents_file 重新读取；文件不可读或顶层格式错误时保留当前配置
    pub fn reload_from_disk(&self) -> Result<ReloadReport, ConfigError> {
        let Some(path) = self.options.agents_file.clone() else {
            return Ok(ReloadReport::default());
        };
        let parsed = match load_config_file(&path) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to load scheduler config: {}", e);
                self.emit(
                    AuditCategory::Config,
                    "config_error",
                    AuditLevel::Error,
                    json!({"path": path.display().to_string(), "error": e.to_string()}),
                );
                return Err(e);
            }
        };
        for rejected in &parsed.rejected {
            tracing::warn!("{}", rejected);
            self.emit(
                AuditCategory::Config,
                "config_error",
                AuditLevel::Warn,
                json!({"path": path.display().to_string(), "error": rejected.to_string()}),
            );
        }
        let mut config = parsed.config;
        if parsed.settings_rejected {
            // 闸门设置不能因为一个坏字段而放开
            tracing::warn!(path = %path.display(), "globalSettings rejected, keeping previous settings");
            config.settings = self.snapshot().settings.clone();
        }
        Ok(self.load_config(config))
    }

    fn apply_config(&self, config: SchedulerConfig) -> ReloadReport {
        let now = self.clock.now().with_timezone(&Utc);
        let mut report = ReloadReport::default();
        {
            let mut inner = self.lock_inner();
            for (id, spec) in &config.agents {
                if let Some(entry) = inner.entries.get_mut(id) {
                    if entry.spec == *spec {
                        continue;
                    }
                    if !entry.spec.trigger.same_kind(&spec.trigger) {
                        entry.trigger = TriggerState::seeded(&spec.trigger, now);
                        entry.retry_at = None;
                        report.reset.push(id.clone());
                    }
                    entry.auto_restart = spec.auto_restart;
                    entry.spec = spec.clone();
                    report.updated.push(id.clone());
                    continue;
                }

                let (trigger, stats) = match inner.restored.remove(id) {
                    Some(saved) if saved.trigger_kind == spec.trigger.kind() => (saved.trigger, saved.stats),
                    Some(saved) => (TriggerState::seeded(&spec.trigger, now), saved.stats),
                    None => (TriggerState::seeded(&spec.trigger, now), AgentRunStats::default()),
                };
                inner
                    .entries
                    .insert(id.clone(), AgentEntry::new(spec.clone(), trigger, stats));
                report.added.push(id.clone());
            }

            let removed: Vec<String> = inner
                .entries
                .keys()
                .filter(|id| !config.agents.contains_key(*id))
                .cloned()
                .collect();
            for id in removed {
                inner.entries.remove(&id);
                if inner.running.contains_key(&id) {
                    tracing::info!(agent = %id, "Agent removed from config, letting current run finish");
                }
                report.removed.push(id);
            }
        }

        *self.config.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(config);

        for list in [&mut report.added, &mut report.updated, &mut report.removed, &mut report.reset] {
            list.sort();
        }
        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "Scheduler config applied"
        );
        self.emit(
            AuditCategory::Config,
            "config_reloaded",
            AuditLevel::Info,
            serde_json::to_value(&report).unwrap_or(Value::Null),
        );
        report
    }

    /// 启动：清理陈旧锁，标记 runOnBoot
    pub fn start(&self) {
        match self.locks.sweep() {
            Ok(swept) => {
                for record in &swept.stale {
                    self.emit(
                        AuditCategory::Lock,
                        "stale_lock_swept",
                        AuditLevel::Warn,
                        json!({"agent": record.agent_id, "pid": record.pid, "acquiredAt": record.acquired_at}),
                    );
                }
                for path in &swept.corrupt {
                    self.emit(
                        AuditCategory::Lock,
                        "corrupt_lock_swept",
                        AuditLevel::Warn,
                        json!({"path": path.display().to_string()}),
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Lock sweep failed: {}", e);
                self.emit(AuditCategory::Lock, "lock_error", AuditLevel::Error, json!({"error": e.to_string()}));
            }
        }

        let boot: Vec<String> = {
            let mut inner = self.lock_inner();
            inner
                .entries
                .values_mut()
                .filter(|e| e.spec.enabled && e.spec.run_on_boot)
                .map(|e| {
                    e.manual_pending = true;
                    e.spec.id.clone()
                })
                .collect()
        };
        self.write_running();
        tracing::info!(run_on_boot = boot.len(), "Scheduler started");
        self.emit(
            AuditCategory::Scheduler,
            "scheduler_started",
            AuditLevel::Info,
            json!({"runOnBoot": boot, "tickSecs": self.options.tick.as_secs()}),
        );
    }

    /// 请求在下一个 tick 运行（仍受闸门与锁约束）；agent 不存在或已禁用返回 false
    pub fn trigger_now(&self, agent_id: &str) -> bool {
        let mut inner = self.lock_inner();
        match inner.entries.get_mut(agent_id) {
            Some(entry) if entry.spec.enabled => {
                entry.manual_pending = true;
                true
            }
            _ => false,
        }
    }

    /// 执行一次调度评估
    pub fn tick(self: &Arc<Self>) -> TickReport {
        let config = self.snapshot();
        let now_local = self.clock.now();
        let inactivity = self.activity.inactivity_secs();
        let mut report = TickReport::default();
        let mut launches = Vec::new();

        {
            let mut inner = self.lock_inner();
            let mut order: Vec<_> = inner
                .entries
                .values()
                .filter(|e| e.spec.enabled)
                .map(|e| (e.spec.priority, e.spec.id.clone()))
                .collect();
            order.sort();

            for (_, id) in order {
                if let Some(launch) =
                    self.evaluate(&mut inner, &id, &config.settings, now_local, inactivity, &mut report)
                {
                    launches.push(launch);
                }
            }
        }

        let now = now_local.with_timezone(&Utc);
        for hook in &self.hooks {
            hook.on_tick(now);
        }

        if !launches.is_empty() {
            self.persist();
        }
        for (spec, token) in launches {
            self.spawn_run(spec, token);
        }
        report
    }

    fn evaluate(
        &self,
        inner: &mut Inner,
        id: &str,
        settings: &GlobalSettings,
        now_local: DateTime<FixedOffset>,
        inactivity: u64,
        report: &mut TickReport,
    ) -> Option<(AgentSpec, LockToken)> {
        if inner.running.contains_key(id) {
            return None;
        }
        let counts = inner.counts();
        let now = now_local.with_timezone(&Utc);
        let entry = inner.entries.get_mut(id)?;

        entry.trigger.observe_activity(&entry.spec.trigger, inactivity);
        let fired = match should_fire(&entry.spec.trigger, &now_local, &entry.trigger, inactivity) {
            Ok(fired) => fired,
            Err(e) => {
                tracing::warn!(agent = %id, "Trigger evaluation failed: {}", e);
                self.emit(
                    AuditCategory::Scheduler,
                    "trigger_eval_error",
                    AuditLevel::Warn,
                    json!({"agent": id, "error": e.to_string()}),
                );
                false
            }
        };
        let retry_due = entry.retry_at.is_some_and(|at| now >= at);
        let reason = if entry.manual_pending {
            FireReason::Manual
        } else if retry_due {
            FireReason::Retry
        } else if fired {
            FireReason::Trigger
        } else {
            return None;
        };

        if let Some(veto) = apply_gates(settings, now_local.time(), inactivity, counts, entry.spec.uses_llm) {
            if entry.last_veto != Some(veto) {
                entry.last_veto = Some(veto);
                self.emit(
                    AuditCategory::Scheduler,
                    "fire_vetoed",
                    AuditLevel::Info,
                    json!({"agent": id, "reason": reason.as_str(), "gate": veto.as_str()}),
                );
            }
            report.skipped.push((id.to_string(), veto.as_str().to_string()));
            return None;
        }
        entry.last_veto = None;
        self.transition(entry, AgentPhase::Scheduled, json!({"reason": reason.as_str()}));

        match self.locks.acquire(id) {
            Ok(AcquireOutcome::Acquired(token)) => {
                if fired {
                    entry.trigger.record_fire(&entry.spec.trigger, now);
                }
                entry.manual_pending = false;
                entry.retry_at = None;
                self.transition(entry, AgentPhase::Launching, json!({}));
                let spec = entry.spec.clone();
                inner.running.insert(
                    id.to_string(),
                    RunningInfo {
                        uses_llm: spec.uses_llm,
                        pid: None,
                        started_at: now,
                        token: token.clone(),
                    },
                );
                report.fired.push(id.to_string());
                Some((spec, token))
            }
            Ok(AcquireOutcome::Busy { pid }) => {
                self.transition(entry, AgentPhase::Idle, json!({"reason": "lock_busy"}));
                tracing::info!(agent = %id, ?pid, "Agent lock busy, skipping this tick");
                self.emit(
                    AuditCategory::Lock,
                    "lock_contention",
                    AuditLevel::Info,
                    json!({"agent": id, "pid": pid}),
                );
                report.skipped.push((id.to_string(), "lock_busy".to_string()));
                None
            }
            Err(e) => {
                self.transition(entry, AgentPhase::Idle, json!({"reason": "lock_error"}));
                tracing::error!(agent = %id, "Lock acquire failed: {}", e);
                self.emit(
                    AuditCategory::Lock,
                    "lock_error",
                    AuditLevel::Error,
                    json!({"agent": id, "error": e.to_string()}),
                );
                report.skipped.push((id.to_string(), "lock_error".to_string()));
                None
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, spec: AgentSpec, token: LockToken) {
        let this = Arc::clone(self);
        let id = spec.id.clone();
        let handle = tokio::spawn(async move { this.run_agent(spec, token).await });
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(id, handle);
    }

    async fn run_agent(self: Arc<Self>, spec: AgentSpec, token: LockToken) {
        let on_spawn = {
            let this = Arc::clone(&self);
            let id = spec.id.clone();
            let token = token.clone();
            move |pid: u32| this.mark_running(&id, &token, pid)
        };
        let result = self.launcher.spawn(&spec, &on_spawn).await;

        if matches!(result, Err(LaunchError::TimedOut { .. })) {
            self.locks.bump_epoch(&spec.id);
        }
        if let Err(e) = self.locks.release_async(&spec.id, &token).await {
            tracing::warn!(agent = %spec.id, "Failed to release lock: {}", e);
            self.emit(
                AuditCategory::Lock,
                "lock_error",
                AuditLevel::Error,
                json!({"agent": spec.id, "error": e.to_string()}),
            );
        }
        self.finish(&spec.id, result);
    }

    fn mark_running(&self, id: &str, token: &LockToken, pid: u32) {
        if let Err(e) = self.locks.set_pid(id, token, pid) {
            tracing::warn!(agent = %id, "Failed to record pid in lock: {}", e);
        }
        {
            let mut inner = self.lock_inner();
            if let Some(info) = inner.running.get_mut(id) {
                info.pid = Some(pid);
            }
            if let Some(entry) = inner.entries.get_mut(id) {
                self.transition(entry, AgentPhase::Running, json!({"pid": pid}));
            }
        }
        self.write_running();
    }

    fn finish(&self, id: &str, result: Result<i32, LaunchError>) {
        let now = self.clock.now().with_timezone(&Utc);
        {
            let mut inner = self.lock_inner();
            let duration_ms = inner
                .running
                .remove(id)
                .map(|info| (now - info.started_at).num_milliseconds());

            match inner.entries.get_mut(id) {
                None => {
                    self.emit(
                        AuditCategory::Scheduler,
                        "agent_finished_after_removal",
                        AuditLevel::Info,
                        json!({"agent": id, "ok": matches!(result, Ok(0))}),
                    );
                }
                Some(entry) => {
                    match result {
                        Ok(0) => {
                            entry.stats.record_success(now);
                            entry.consecutive_failures = 0;
                            tracing::info!(agent = %id, ?duration_ms, "Agent run succeeded");
                            self.transition(
                                entry,
                                AgentPhase::Succeeded,
                                json!({"exitCode": 0, "durationMs": duration_ms}),
                            );
                        }
                        Ok(code) => self.record_failure(entry, now, format!("exit code {}", code), false),
                        Err(e) => {
                            let spawn_error = e.is_spawn();
                            self.record_failure(entry, now, e.to_string(), spawn_error)
                        }
                    }
                    self.transition(entry, AgentPhase::Idle, json!({}));
                }
            }
        }
        self.persist();
        self.write_running();
        self.idle.notify_waiters();
    }

    fn record_failure(&self, entry: &mut AgentEntry, now: DateTime<Utc>, error: String, spawn_error: bool) {
        entry.stats.record_failure(now, error.clone());
        entry.consecutive_failures += 1;
        let attempt = entry.consecutive_failures;
        tracing::warn!(agent = %entry.spec.id, attempt, "Agent run failed: {}", error);
        self.transition(
            entry,
            AgentPhase::Failed,
            json!({"error": error, "consecutiveFailures": attempt, "spawnError": spawn_error}),
        );

        if !(spawn_error || entry.auto_restart) {
            return;
        }
        if attempt <= entry.spec.max_retries {
            let delay = backoff_delay(self.options.backoff_base, self.options.backoff_max, attempt);
            let retry_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            entry.retry_at = Some(retry_at);
            self.emit(
                AuditCategory::Scheduler,
                "retry_scheduled",
                AuditLevel::Info,
                json!({"agent": entry.spec.id, "attempt": attempt, "delaySecs": delay.as_secs(), "retryAt": retry_at}),
            );
        } else {
            entry.retry_at = None;
            if entry.auto_restart {
                entry.auto_restart = false;
                tracing::warn!(agent = %entry.spec.id, "Retries exhausted, autoRestart disabled until restart");
                self.emit(
                    AuditCategory::Scheduler,
                    "auto_restart_disabled",
                    AuditLevel::Warn,
                    json!({"agent": entry.spec.id, "maxRetries": entry.spec.max_retries}),
                );
            } else {
                self.emit(
                    AuditCategory::Scheduler,
                    "retries_exhausted",
                    AuditLevel::Warn,
                    json!({"agent": entry.spec.id, "maxRetries": entry.spec.max_retries}),
                );
            }
        }
    }

    /// 调度主循环：固定周期 tick，收到 ConfigChanged 时热更新
    pub async fn run(
        self: &Arc<Self>,
        cancel: CancellationToken,
        mut reload_rx: Option<mpsc::Receiver<ConfigChanged>>,
    ) {
        let mut ticker = tokio::time::interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick();
                    if !report.fired.is_empty() {
                        tracing::info!(fired = ?report.fired, "Tick launched agents");
                    }
                }
                Some(change) = next_change(&mut reload_rx) => {
                    tracing::info!(path = %change.path.display(), "Reloading scheduler config");
                    let _ = self.reload_from_disk();
                }
            }
        }
        tracing::info!("Scheduler loop stopped");
    }

    /// 等待所有运行结束
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock_inner().running.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// 停止：等待运行中的 agent 至多 grace，超时则中止（子进程随之被 kill）并释放锁
    pub async fn stop(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            let handles: Vec<JoinHandle<()>> = self
                .tasks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .drain()
                .map(|(_, h)| h)
                .collect();
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }

            let now = self.clock.now().with_timezone(&Utc);
            let aborted: Vec<(String, LockToken)> = {
                let mut inner = self.lock_inner();
                let drained: Vec<(String, LockToken)> = inner
                    .running
                    .drain()
                    .map(|(id, info)| (id, info.token))
                    .collect();
                for (id, _) in &drained {
                    if let Some(entry) = inner.entries.get_mut(id) {
                        entry.stats.record_failure(now, "aborted on shutdown");
                        self.transition(entry, AgentPhase::Idle, json!({"reason": "shutdown"}));
                    }
                }
                drained
            };
            for (id, token) in aborted {
                if let Err(e) = self.locks.release_async(&id, &token).await {
                    tracing::warn!(agent = %id, "Failed to release lock on shutdown: {}", e);
                }
                self.emit(
                    AuditCategory::Scheduler,
                    "agent_aborted",
                    AuditLevel::Warn,
                    json!({"agent": id}),
                );
            }
        }
        self.persist();
        self.write_running();
        self.emit(AuditCategory::Scheduler, "scheduler_stopped", AuditLevel::Info, json!({}));
    }

    /// 所有已注册 agent 的状态（按 id 排序）
    pub fn stats(&self) -> BTreeMap<String, AgentStatus> {
        let inner = self.lock_inner();
        inner
            .entries
            .iter()
            .map(|(id, e)| {
                let status = AgentStatus {
                    id: id.clone(),
                    enabled: e.spec.enabled,
                    trigger: e.spec.trigger.kind().to_string(),
                    phase: e.phase,
                    stats: e.stats.clone(),
                    last_fire_at: e.trigger.last_fire_at,
                    retry_at: e.retry_at,
                    consecutive_failures: e.consecutive_failures,
                    auto_restart: e.auto_restart,
                    pid: inner.running.get(id).and_then(|r| r.pid),
                };
                (id.clone(), status)
            })
            .collect()
    }

    pub fn trigger_state(&self, agent_id: &str) -> Option<TriggerState> {
        self.lock_inner().entries.get(agent_id).map(|e| e.trigger.clone())
    }

    pub fn running_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_inner().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn persist(&self) {
        let Some(store) = &self.state_store else {
            return;
        };
        let state = {
            let inner = self.lock_inner();
            let mut agents = inner.restored.clone();
            for (id, e) in &inner.entries {
                agents.insert(
                    id.clone(),
                    PersistedAgent {
                        trigger_kind: e.spec.trigger.kind().to_string(),
                        trigger: e.trigger.clone(),
                        stats: e.stats.clone(),
                    },
                );
            }
            PersistedState {
                saved_at: Some(Utc::now()),
                agents,
            }
        };
        if let Err(e) = store.save(&state) {
            tracing::warn!(path = %store.path().display(), "Failed to persist scheduler state: {}", e);
        }
    }

    fn write_running(&self) {
        let Some(registry) = &self.running_registry else {
            return;
        };
        let entries: Vec<RunningEntry> = {
            let inner = self.lock_inner();
            let mut entries: Vec<RunningEntry> = inner
                .running
                .iter()
                .map(|(id, info)| RunningEntry {
                    agent_id: id.clone(),
                    pid: info.pid,
                    started_at: info.started_at,
                    uses_llm: info.uses_llm,
                })
                .collect();
            entries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            entries
        };
        if let Err(e) = registry.write(&entries) {
            tracing::warn!(path = %registry.path().display(), "Failed to write running registry: {}", e);
        }
    }
}

async fn next_change(rx: &mut Option<mpsc::Receiver<ConfigChanged>>) -> Option<ConfigChanged> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 关闭时停止调度器
pub struct SchedulerCleanup {
    scheduler: Arc<Scheduler>,
    grace: Duration,
}

impl SchedulerCleanup {
    pub fn new(scheduler: Arc<Scheduler>, grace: Duration) -> Self {
        Self { scheduler, grace }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.scheduler.stop(self.grace).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scheduler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::scheduler::spec::{Priority, Trigger};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// 可控启动器：每次 spawn 等待一个许可，返回预设退出码
    struct GatedLauncher {
        gate: Semaphore,
        exit: Mutex<Vec<Result<i32, &'static str>>>,
        calls: AtomicUsize,
    }

    impl GatedLauncher {
        fn new(exits: Vec<Result<i32, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                exit: Mutex::new(exits),
                calls: AtomicUsize::new(0),
            })
        }

        fn open(&self, runs: usize) {
            self.gate.add_permits(runs);
        }
    }

    #[async_trait]
    impl AgentLauncher for GatedLauncher {
        async fn spawn(&self, spec: &AgentSpec, on_spawn: &(dyn Fn(u32) + Send + Sync)) -> Result<i32, LaunchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            on_spawn(std::process::id());
            self.gate.acquire().await.unwrap().forget();
            let next = {
                let mut exits = self.exit.lock().unwrap();
                if exits.is_empty() { Ok(0) } else { exits.remove(0) }
            };
            next.map_err(|msg| LaunchError::Spawn {
                agent: spec.id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        clock: Arc<ManualClock>,
        launcher: Arc<GatedLauncher>,
        audit: Arc<MemoryAudit>,
        _dir: tempfile::TempDir,
    }

    fn harness(exits: Vec<Result<i32, &'static str>>, options: SchedulerOptions) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let launcher = GatedLauncher::new(exits);
        let audit = Arc::new(MemoryAudit::new());
        let locks = Arc::new(LockManager::new(dir.path().join("locks")));
        let scheduler = Arc::new(
            Scheduler::new(options, locks, launcher.clone(), audit.clone()).with_clock(clock.clone()),
        );
        Harness {
            scheduler,
            clock,
            launcher,
            audit,
            _dir: dir,
        }
    }

    fn config_of(specs: Vec<AgentSpec>) -> SchedulerConfig {
        SchedulerConfig {
            settings: GlobalSettings::default(),
            agents: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    #[test]
    fn test_backoff_is_bounded_exponential() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(600);
        let delays: Vec<u64> = (1..=9).map(|n| backoff_delay(base, max, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 600, 600]);
        assert_eq!(backoff_delay(base, max, 200), max);
    }

    #[tokio::test]
    async fn test_interval_agent_runs_and_records_stats() {
        let h = harness(vec![], SchedulerOptions::default());
        h.scheduler
            .load_config(config_of(vec![AgentSpec::new("organizer", Trigger::Interval { interval: 60 })]));
        h.scheduler.start();

        assert!(h.scheduler.tick().fired.is_empty());
        h.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(h.scheduler.tick().fired, vec!["organizer"]);
        // 运行中不会重复启动
        assert!(h.scheduler.tick().fired.is_empty());

        h.launcher.open(1);
        h.scheduler.wait_idle().await;
        let status = &h.scheduler.stats()["organizer"];
        assert_eq!(status.stats.total_runs, 1);
        assert_eq!(status.stats.successes, 1);
        assert_eq!(status.phase, AgentPhase::Idle);
        assert!(!h.scheduler.locks().lock_path("organizer").exists());

        let phases: Vec<String> = h
            .audit
            .named("agent_transition")
            .iter()
            .map(|e| e.details["to"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(phases, vec!["scheduled", "launching", "running", "succeeded", "idle"]);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_partitions_llm_agents() {
        let h = harness(vec![], SchedulerOptions::default());
        let mut a = AgentSpec::new("llm_a", Trigger::Manual);
        a.uses_llm = true;
        a.priority = Priority::High;
        let mut b = AgentSpec::new("llm_b", Trigger::Manual);
        b.uses_llm = true;
        let c = AgentSpec::new("plain", Trigger::Manual);
        h.scheduler.load_config(config_of(vec![a, b, c]));
        for id in ["llm_a", "llm_b", "plain"] {
            assert!(h.scheduler.trigger_now(id));
        }

        let report = h.scheduler.tick();
        assert_eq!(report.fired, vec!["llm_a", "plain"]);
        assert!(report
            .skipped
            .contains(&("llm_b".to_string(), "max_concurrent_llm".to_string())));

        h.launcher.open(2);
        h.scheduler.wait_idle().await;
        assert_eq!(h.scheduler.tick().fired, vec!["llm_b"]);
        h.launcher.open(1);
        h.scheduler.wait_idle().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_backs_off_then_disables_auto_restart() {
        let options = SchedulerOptions {
            backoff_base: Duration::from_secs(10),
            ..Default::default()
        };
        let h = harness(vec![Err("boom"), Err("boom"), Err("boom")], options);
        let mut spec = AgentSpec::new("flaky", Trigger::Manual);
        spec.auto_restart = true;
        spec.max_retries = 2;
        h.scheduler.load_config(config_of(vec![spec]));
        h.scheduler.trigger_now("flaky");
        h.launcher.open(10);

        assert_eq!(h.scheduler.tick().fired.len(), 1);
        h.scheduler.wait_idle().await;
        let status = h.scheduler.stats()["flaky"].clone();
        assert_eq!(status.retry_at, Some(t0() + chrono::Duration::seconds(10)));

        h.clock.advance(chrono::Duration::seconds(9));
        assert!(h.scheduler.tick().fired.is_empty());
        h.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(h.scheduler.tick().fired.len(), 1);
        h.scheduler.wait_idle().await;
        assert_eq!(
            h.scheduler.stats()["flaky"].retry_at,
            Some(t0() + chrono::Duration::seconds(30))
        );

        h.clock.advance(chrono::Duration::seconds(20));
        assert_eq!(h.scheduler.tick().fired.len(), 1);
        h.scheduler.wait_idle().await;

        let status = h.scheduler.stats()["flaky"].clone();
        assert_eq!(status.stats.failures, 3);
        assert!(!status.auto_restart);
        assert!(status.retry_at.is_none());
        assert_eq!(h.audit.count("auto_restart_disabled"), 1);

        h.clock.advance(chrono::Duration::seconds(3600));
        assert!(h.scheduler.tick().fired.is_empty());
        // 持久化配置不受影响
        assert!(h.scheduler.snapshot().agents["flaky"].auto_restart);
    }

    #[tokio::test]
    async fn test_reload_preserves_or_resets_trigger_state() {
        let h = harness(vec![], SchedulerOptions::default());
        h.scheduler.load_config(config_of(vec![
            AgentSpec::new("keep", Trigger::Interval { interval: 60 }),
            AgentSpec::new("retime", Trigger::Interval { interval: 60 }),
            AgentSpec::new("swap", Trigger::Interval { interval: 60 }),
            AgentSpec::new("gone", Trigger::Manual),
        ]));
        let before = h.scheduler.trigger_state("keep").unwrap();
        h.clock.advance(chrono::Duration::seconds(30));

        let mut retime = AgentSpec::new("retime", Trigger::Interval { interval: 120 });
        retime.comment = Some("slower".into());
        let report = h.scheduler.load_config(config_of(vec![
            AgentSpec::new("keep", Trigger::Interval { interval: 60 }),
            retime,
            AgentSpec::new("swap", Trigger::TimeOfDay { time: "02:00".into() }),
            AgentSpec::new("fresh", Trigger::Manual),
        ]));

        assert_eq!(report.added, vec!["fresh"]);
        assert_eq!(report.updated, vec!["retime", "swap"]);
        assert_eq!(report.removed, vec!["gone"]);
        assert_eq!(report.reset, vec!["swap"]);

        assert_eq!(h.scheduler.trigger_state("keep").unwrap(), before);
        assert_eq!(h.scheduler.trigger_state("retime").unwrap(), before);
        assert_eq!(
            h.scheduler.trigger_state("swap").unwrap().last_fire_at,
            Some(t0() + chrono::Duration::seconds(30))
        );
        assert!(h.scheduler.trigger_state("gone").is_none());
    }

    #[tokio::test]
    async fn test_removed_agent_finishes_current_run() {
        let h = harness(vec![], SchedulerOptions::default());
        h.scheduler.load_config(config_of(vec![AgentSpec::new("doomed", Trigger::Manual)]));
        h.scheduler.trigger_now("doomed");
        assert_eq!(h.scheduler.tick().fired, vec!["doomed"]);

        h.scheduler.load_config(config_of(vec![]));
        assert_eq!(h.scheduler.running_agents(), vec!["doomed"]);

        h.launcher.open(1);
        h.scheduler.wait_idle().await;
        assert!(h.scheduler.running_agents().is_empty());
        assert_eq!(h.audit.count("agent_finished_after_removal"), 1);
        assert!(!h.scheduler.locks().lock_path("doomed").exists());
    }

    #[tokio::test]
    async fn test_pause_all_vetoes_without_consuming_fire() {
        let h = harness(vec![], SchedulerOptions::default());
        let mut config = config_of(vec![AgentSpec::new("organizer", Trigger::Interval { interval: 60 })]);
        config.settings.pause_all = true;
        h.scheduler.load_config(config.clone());

        h.clock.advance(chrono::Duration::seconds(61));
        for _ in 0..3 {
            let report = h.scheduler.tick();
            assert!(report.fired.is_empty());
            assert_eq!(report.skipped, vec![("organizer".to_string(), "paused_all".to_string())]);
        }
        assert_eq!(h.audit.count("fire_vetoed"), 1);

        config.settings.pause_all = false;
        h.scheduler.load_config(config);
        assert_eq!(h.scheduler.tick().fired, vec!["organizer"]);
        h.launcher.open(1);
        h.scheduler.wait_idle().await;
    }

    #[tokio::test]
    async fn test_malformed_settings_reload_keeps_previous_gates() {
        let files = tempfile::tempdir().unwrap();
        let agents_file = files.path().join("agents.json");
        std::fs::write(
            &agents_file,
            r#"{"globalSettings": {"pauseAll": true, "maxConcurrentAgents": 1},
                "agents": {"organizer": {"type": "interval", "interval": 300}}}"#,
        )
        .unwrap();
        let h = harness(
            vec![],
            SchedulerOptions {
                agents_file: Some(agents_file.clone()),
                ..SchedulerOptions::default()
            },
        );
        h.scheduler.reload_from_disk().unwrap();
        h.clock.advance(chrono::Duration::seconds(400));
        assert!(h.scheduler.tick().fired.is_empty());

        std::fs::write(
            &agents_file,
            r#"{"globalSettings": {"pauseAll": true, "maxConcurrentAgents": "x"},
                "agents": {"organizer": {"type": "interval", "interval": 300, "comment": "edited"}}}"#,
        )
        .unwrap();
        let report = h.scheduler.reload_from_disk().unwrap();
        assert_eq!(report.updated, vec!["organizer"]);

        let snapshot = h.scheduler.snapshot();
        let settings = &snapshot.settings;
        assert!(settings.pause_all);
        assert_eq!(settings.max_concurrent_agents, 1);
        assert!(h.scheduler.tick().fired.is_empty());
        assert!(h.audit.count("config_error") >= 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let options = SchedulerOptions {
            state_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(t0()));
        let launcher = GatedLauncher::new(vec![]);
        launcher.open(10);
        let config = config_of(vec![AgentSpec::new("nightly", Trigger::TimeOfDay { time: "02:00".into() })]);

        let first = Arc::new(
            Scheduler::new(
                options.clone(),
                Arc::new(LockManager::new(dir.path().join("locks"))),
                launcher.clone(),
                Arc::new(MemoryAudit::new()),
            )
            .with_clock(clock.clone()),
        );
        first.load_config(config.clone());
        // 次日 02:00 之后触发一次
        clock.advance(chrono::Duration::hours(15));
        assert_eq!(first.tick().fired, vec!["nightly"]);
        first.wait_idle().await;
        first.stop(Duration::from_secs(1)).await;

        let second = Arc::new(
            Scheduler::new(
                options,
                Arc::new(LockManager::new(dir.path().join("locks"))),
                launcher.clone(),
                Arc::new(MemoryAudit::new()),
            )
            .with_clock(clock.clone()),
        );
        second.load_config(config);
        second.start();
        clock.advance(chrono::Duration::minutes(5));
        assert!(second.tick().fired.is_empty());
        assert_eq!(second.stats()["nightly"].stats.total_runs, 1);

        let running = RunningRegistry::new(dir.path().join("running.json"));
        assert!(running.read().is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_hung_runs_and_releases_locks() {
        let h = harness(vec![], SchedulerOptions::default());
        h.scheduler.load_config(config_of(vec![AgentSpec::new("hung", Trigger::Manual)]));
        h.scheduler.trigger_now("hung");
        assert_eq!(h.scheduler.tick().fired, vec!["hung"]);

        h.scheduler.stop(Duration::from_millis(50)).await;
        assert!(h.scheduler.running_agents().is_empty());
        assert!(!h.scheduler.locks().lock_path("hung").exists());
        assert_eq!(h.audit.count("agent_aborted"), 1);
        assert_eq!(h.audit.count("scheduler_stopped"), 1);
    }
}
