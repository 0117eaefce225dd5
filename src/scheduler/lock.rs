//! 单实例锁：`<dir>/<agent>.lock`（JSON LockRecord）
//!
//! - 获取：先写临时文件再 hard_link 到锁路径，链接成功即获得锁（原子、内容完整）
//! - 已存在：探测存活（主机、重启纪元、PID、命令行签名），存活返回 Busy
//! - 陈旧 / 损坏：在 `<agent>.reclaim` 守卫下重读，仍是同一条记录才删除，然后重试
//! - 释放：按 token 比较后删除，锁已被他人回收时为 no-op
//!
//! 所有操作都不阻塞等待锁，调用方在下一个 tick 重试。

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 回收守卫文件超过该时长视为持有者已崩溃
const RECLAIM_GUARD_STALE: Duration = Duration::from_secs(30);
const MAX_ACQUIRE_ATTEMPTS: usize = 3;
const RELEASE_GUARD_RETRIES: usize = 20;

/// 锁错误（竞争本身不是错误，见 AcquireOutcome::Busy）
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode lock record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("lock task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 磁盘上的锁记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub agent_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub host_token: String,
    pub token: String,
}

impl LockRecord {
    fn new(agent_id: &str, pid: u32, host_token: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            pid,
            acquired_at: Utc::now(),
            host_token: host_token.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// 持锁凭证，释放时按它做 compare-and-delete
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LockToken),
    /// 已被存活实例持有；pid 未知（记录损坏且正被他人回收）时为 None
    Busy { pid: Option<u32> },
}

/// 进程表探测
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, pid: u32) -> bool;
    /// 进程命令行；无法读取时返回 None（视为签名匹配）
    fn command_line(&self, pid: u32) -> Option<String>;
}

/// 基于操作系统的探测
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessProbe;

#[cfg(target_os = "linux")]
impl ProcessProbe for OsProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        // 僵尸进程（Z）已退出，只是尚未被回收
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(true, |state| state != 'Z'),
            Err(_) => false,
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
        let cmd = String::from_utf8_lossy(&raw).replace('\0', " ");
        let cmd = cmd.trim();
        (!cmd.is_empty()).then(|| cmd.to_string())
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
impl ProcessProbe for OsProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let out = std::process::Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        let cmd = String::from_utf8_lossy(&out.stdout).trim().to_string();
        (!cmd.is_empty()).then_some(cmd)
    }
}

#[cfg(not(unix))]
impl ProcessProbe for OsProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn command_line(&self, _pid: u32) -> Option<String> {
        None
    }
}

/// 本机标识：/etc/hostname，其次 COMPUTERNAME
pub fn default_host_token() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("COMPUTERNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// 锁状态（`hive locks show`）
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub record: LockRecord,
    pub live: bool,
}

/// sweep 结果
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub stale: Vec<LockRecord>,
    pub corrupt: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.corrupt.is_empty()
    }
}

enum Slot {
    Empty,
    Record(LockRecord),
    Corrupt(String),
}

/// 回收守卫，drop 时删除守卫文件
struct ReclaimGuard {
    path: PathBuf,
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct LockManager {
    dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    signature: Option<String>,
    host_token: String,
    pid: u32,
    started_at: DateTime<Utc>,
    epochs: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            probe: Arc::new(OsProcessProbe),
            signature: None,
            host_token: default_host_token(),
            pid: std::process::id(),
            started_at: Utc::now(),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 持锁进程命令行中应包含的子串；空串表示不校验
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        let signature = signature.into();
        self.signature = (!signature.trim().is_empty()).then_some(signature);
        self
    }

    pub fn with_host_token(mut self, host_token: impl Into<String>) -> Self {
        self.host_token = host_token.into();
        self
    }

    /// 以指定 pid 身份写锁（测试中模拟多个进程）
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize(agent_id)))
    }

    /// 尝试获取锁，从不阻塞
    pub fn acquire(&self, agent_id: &str) -> Result<AcquireOutcome, LockError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.lock_path(agent_id);
        let mut last_pid = None;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let record = LockRecord::new(agent_id, self.pid, &self.host_token);
            if self.publish(&path, &record)? {
                tracing::debug!(agent = %agent_id, pid = record.pid, "Lock acquired");
                return Ok(AcquireOutcome::Acquired(LockToken(record.token)));
            }

            match self.read(&path)? {
                Slot::Empty => continue,
                Slot::Record(existing) => {
                    last_pid = Some(existing.pid);
                    if self.is_live(&existing) {
                        return Ok(AcquireOutcome::Busy {
                            pid: Some(existing.pid),
                        });
                    }
                    tracing::warn!(
                        agent = %agent_id,
                        pid = existing.pid,
                        acquired_at = %existing.acquired_at,
                        "Reclaiming stale lock"
                    );
                    let token = existing.token.clone();
                    let reclaimed = self.reclaim(&path, |slot| {
                        matches!(slot, Slot::Record(r) if r.token == token)
                    })?;
                    if !reclaimed {
                        return Ok(AcquireOutcome::Busy {
                            pid: Some(existing.pid),
                        });
                    }
                }
                Slot::Corrupt(raw) => {
                    tracing::warn!(agent = %agent_id, path = %path.display(), "Removing corrupt lock file");
                    let reclaimed =
                        self.reclaim(&path, |slot| matches!(slot, Slot::Corrupt(r) if *r == raw))?;
                    if !reclaimed {
                        return Ok(AcquireOutcome::Busy { pid: None });
                    }
                }
            }
        }

        Ok(AcquireOutcome::Busy { pid: last_pid })
    }

    /// 按 token 释放；返回是否真的删除了记录
    pub fn release(&self, agent_id: &str, token: &LockToken) -> Result<bool, LockError> {
        let path = self.lock_path(agent_id);
        let _guard = self.guard_with_retry(&path)?;
        if _guard.is_none() {
            tracing::warn!(agent = %agent_id, "Reclaim guard busy, releasing without it");
        }
        match self.read(&path)? {
            Slot::Record(r) if r.token == token.0 => {
                remove_if_exists(&path)?;
                tracing::debug!(agent = %agent_id, "Lock released");
                Ok(true)
            }
            _ => {
                tracing::debug!(agent = %agent_id, "Lock already gone or reclaimed, release is a no-op");
                Ok(false)
            }
        }
    }

    /// 异步上下文中的 release：守卫重试会 sleep，放到阻塞线程池执行
    pub async fn release_async(self: &Arc<Self>, agent_id: &str, token: &LockToken) -> Result<bool, LockError> {
        let manager = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let token = token.clone();
        tokio::task::spawn_blocking(move || manager.release(&agent_id, &token))
            .await
            .map_err(|e| LockError::Task(e.to_string()))?
    }

    /// 把持锁记录的 pid 更新为实际子进程 pid
    pub fn set_pid(&self, agent_id: &str, token: &LockToken, pid: u32) -> Result<bool, LockError> {
        let path = self.lock_path(agent_id);
        match self.read(&path)? {
            Slot::Record(mut record) if record.token == token.0 => {
                record.pid = pid;
                let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
                write_record(&tmp, &record)?;
                fs::rename(&tmp, &path).map_err(io_err(&path))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 推进该 agent 的重启纪元：此前获取的记录一律视为陈旧
    pub fn bump_epoch(&self, agent_id: &str) {
        self.epochs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id.to_string(), Utc::now());
    }

    /// 记录是否存活
    pub fn is_live(&self, record: &LockRecord) -> bool {
        if record.host_token != self.host_token {
            return false;
        }
        let epoch = self
            .epochs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&record.agent_id)
            .copied();
        if epoch.is_some_and(|epoch| record.acquired_at <= epoch) {
            return false;
        }
        if record.pid == self.pid {
            // 本进程启动前写下的同 pid 记录：pid 被复用
            return record.acquired_at >= self.started_at;
        }
        if !self.probe.is_running(record.pid) {
            return false;
        }
        match (&self.signature, self.probe.command_line(record.pid)) {
            (Some(signature), Some(cmd)) => cmd.contains(signature.as_str()),
            _ => true,
        }
    }

    /// 清理所有陈旧与损坏的锁文件
    pub fn sweep(&self) -> Result<SweepReport, LockError> {
        let mut report = SweepReport::default();
        for path in self.lock_files()? {
            match self.read(&path)? {
                Slot::Empty => {}
                Slot::Record(record) => {
                    if self.is_live(&record) {
                        continue;
                    }
                    let token = record.token.clone();
                    if self.reclaim(&path, |slot| matches!(slot, Slot::Record(r) if r.token == token))? {
                        tracing::info!(agent = %record.agent_id, pid = record.pid, "Swept stale lock");
                        report.stale.push(record);
                    }
                }
                Slot::Corrupt(raw) => {
                    if self.reclaim(&path, |slot| matches!(slot, Slot::Corrupt(r) if *r == raw))? {
                        tracing::info!(path = %path.display(), "Swept corrupt lock");
                        report.corrupt.push(path);
                    }
                }
            }
        }
        Ok(report)
    }

    /// 当前所有锁记录及存活状态（按 agent 排序，损坏文件跳过）
    pub fn list(&self) -> Result<Vec<LockStatus>, LockError> {
        let mut out = Vec::new();
        for path in self.lock_files()? {
            if let Slot::Record(record) = self.read(&path)? {
                let live = self.is_live(&record);
                out.push(LockStatus { record, live });
            }
        }
        out.sort_by(|a, b| a.record.agent_id.cmp(&b.record.agent_id));
        Ok(out)
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
            .collect())
    }

    /// 写临时文件并 hard_link 到锁路径；目标已存在返回 false
    fn publish(&self, path: &Path, record: &LockRecord) -> Result<bool, LockError> {
        let tmp = path.with_extension(format!("{}.tmp", record.token));
        write_record(&tmp, record)?;
        let linked = match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        };
        let _ = fs::remove_file(&tmp);
        linked
    }

    fn read(&self, path: &Path) -> Result<Slot, LockError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(match serde_json::from_str::<LockRecord>(&raw) {
                Ok(record) => Slot::Record(record),
                Err(_) => Slot::Corrupt(raw),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Slot::Empty),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// 守卫下重读，`still_same` 成立才删除；拿不到守卫返回 false
    fn reclaim(&self, path: &Path, still_same: impl Fn(&Slot) -> bool) -> Result<bool, LockError> {
        let Some(_guard) = self.try_guard(path)? else {
            return Ok(false);
        };
        if still_same(&self.read(path)?) {
            remove_if_exists(path)?;
        }
        Ok(true)
    }

    fn try_guard(&self, lock_path: &Path) -> Result<Option<ReclaimGuard>, LockError> {
        let path = lock_path.with_extension("reclaim");
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Some(ReclaimGuard { path })),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > RECLAIM_GUARD_STALE);
                    if !stale {
                        return Ok(None);
                    }
                    tracing::warn!(path = %path.display(), "Removing abandoned reclaim guard");
                    let _ = fs::remove_file(&path);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
        Ok(None)
    }

    fn guard_with_retry(&self, lock_path: &Path) -> Result<Option<ReclaimGuard>, LockError> {
        for _ in 0..RELEASE_GUARD_RETRIES {
            if let Some(guard) = self.try_guard(lock_path)? {
                return Ok(Some(guard));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(None)
    }
}

fn write_record(path: &Path, record: &LockRecord) -> Result<(), LockError> {
    let json = serde_json::to_vec_pretty(record)?;
    let mut file = fs::File::create(path).map_err(io_err(path))?;
    file.write_all(&json).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// agent id -> 文件名
fn sanitize(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
