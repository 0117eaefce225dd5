//! 审批队列（SQLite）
//!
//! 状态机 pending → {approved, rejected, expired}，终态不可变。
//! 状态迁移是单条 `UPDATE ... WHERE status = 'pending'`，受影响行数为 0 即说明已被他人决定。

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    skill_id TEXT NOT NULL,
    inputs TEXT NOT NULL,
    requested_at INTEGER NOT NULL,
    requested_by TEXT NOT NULL,
    trust_level TEXT NOT NULL,
    reason_codes TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    decided_by TEXT,
    decided_at INTEGER,
    result TEXT
);
CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status, requested_at);
";

/// 过期由系统执行时记录的决定者
pub const EXPIRY_ACTOR: &str = "system:expiry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("approval item '{0}' not found")]
    NotFound(String),

    #[error("approval item '{id}' already decided ({status})")]
    AlreadyDecided { id: String, status: ApprovalStatus },

    #[error("cannot transition approval item to '{0}'")]
    InvalidTransition(ApprovalStatus),

    #[error("approval storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("approval payload error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failed to prepare approval database: {0}")]
    Io(#[from] std::io::Error),
}

/// 队列中的一次技能调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalItem {
    pub id: String,
    pub skill_id: String,
    pub inputs: Value,
    /// 毫秒时间戳
    pub requested_at: i64,
    pub requested_by: String,
    /// 发起调用时的信任级别
    pub trust_level: String,
    pub reason_codes: Vec<String>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<i64>,
    /// 批准后执行的结果（成功输出或错误）
    pub result: Option<Value>,
}

/// 入队请求
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub skill_id: String,
    pub inputs: Value,
    pub requested_by: String,
    pub trust_level: String,
    pub reason_codes: Vec<String>,
}

impl ApprovalRequest {
    pub fn new(skill_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            skill_id: skill_id.into(),
            inputs,
            requested_by: "system".to_string(),
            trust_level: String::new(),
            reason_codes: Vec::new(),
        }
    }

    pub fn requested_by(mut self, actor: impl Into<String>) -> Self {
        self.requested_by = actor.into();
        self
    }

    pub fn trust_level(mut self, level: impl Into<String>) -> Self {
        self.trust_level = level.into();
        self
    }

    pub fn reason_codes(mut self, codes: Vec<String>) -> Self {
        self.reason_codes = codes;
        self
    }
}

pub struct ApprovalQueue {
    conn: Mutex<Connection>,
}

impl ApprovalQueue {
    /// 打开（或创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApprovalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, ApprovalError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ApprovalError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 入队为 pending，返回 id
    pub fn enqueue(&self, request: ApprovalRequest) -> Result<String, ApprovalError> {
        let id = format!("appr_{}", uuid::Uuid::new_v4().simple());
        let inputs = serde_json::to_string(&request.inputs)?;
        let reasons = serde_json::to_string(&request.reason_codes)?;
        self.conn().execute(
            "INSERT INTO approvals (id, skill_id, inputs, requested_at, requested_by, trust_level, reason_codes, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
            params![
                id,
                request.skill_id,
                inputs,
                Utc::now().timestamp_millis(),
                request.requested_by,
                request.trust_level,
                reasons,
            ],
        )?;
        tracing::info!(approval = %id, skill = %request.skill_id, "Approval enqueued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<ApprovalItem, ApprovalError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM approvals WHERE id = ?1")?;
        stmt.query_row(params![id], row_to_item)
            .optional()?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))
    }

    /// 按请求时间升序列出；status 为 None 时列出全部
    pub fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalItem>, ApprovalError> {
        let conn = self.conn();
        let items = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM approvals WHERE status = ?1 ORDER BY requested_at ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(params![status.as_str()], row_to_item)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM approvals ORDER BY requested_at ASC, rowid ASC")?;
                let rows = stmt.query_map([], row_to_item)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(items)
    }

    pub fn list_pending(&self) -> Result<Vec<ApprovalItem>, ApprovalError> {
        self.list(Some(ApprovalStatus::Pending))
    }

    /// pending → 终态（compare-and-swap）
    pub fn transition(&self, id: &str, to: ApprovalStatus, actor: &str) -> Result<ApprovalItem, ApprovalError> {
        if !to.is_terminal() {
            return Err(ApprovalError::InvalidTransition(to));
        }
        let changed = self.conn().execute(
            "UPDATE approvals SET status = ?1, decided_by = ?2, decided_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![to.as_str(), actor, Utc::now().timestamp_millis(), id],
        )?;
        let item = self.get(id)?;
        if changed == 0 {
            return Err(ApprovalError::AlreadyDecided {
                id: id.to_string(),
                status: item.status,
            });
        }
        tracing::info!(approval = %id, status = %to, actor = %actor, "Approval decided");
        Ok(item)
    }

    /// 记录批准后执行的结果
    pub fn record_result(&self, id: &str, result: &Value) -> Result<(), ApprovalError> {
        let payload = serde_json::to_string(result)?;
        let changed = self.conn().execute(
            "UPDATE approvals SET result = ?1 WHERE id = ?2",
            params![payload, id],
        )?;
        if changed == 0 {
            return Err(ApprovalError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// 把请求时间早于 cutoff 的 pending 项标记为 expired（decided_at 记为 now），返回被过期的 id
    pub fn expire(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<String>, ApprovalError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM approvals WHERE status = 'pending' AND requested_at < ?1 ORDER BY requested_at",
            )?;
            let rows = stmt.query_map(params![cutoff_ms], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for id in &ids {
            tx.execute(
                "UPDATE approvals SET status = 'expired', decided_by = ?1, decided_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![EXPIRY_ACTOR, now_ms, id],
            )?;
        }
        tx.commit()?;
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Expired stale approval items");
        }
        Ok(ids)
    }

    /// 删除决定时间早于 cutoff 的终态项，返回删除条数
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, ApprovalError> {
        let removed = self.conn().execute(
            "DELETE FROM approvals WHERE status != 'pending' AND COALESCE(decided_at, requested_at) < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<ApprovalItem> {
    let json_col = |idx: &str| -> rusqlite::Result<Value> {
        let raw: String = row.get(idx)?;
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    let status: String = row.get("status")?;
    let result: Option<String> = row.get("result")?;
    let reason_codes = match json_col("reason_codes")? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Ok(ApprovalItem {
        id: row.get("id")?,
        skill_id: row.get("skill_id")?,
        inputs: json_col("inputs")?,
        requested_at: row.get("requested_at")?,
        requested_by: row.get("requested_by")?,
        trust_level: row.get("trust_level")?,
        reason_codes,
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        decided_by: row.get("decided_by")?,
        decided_at: row.get("decided_at")?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn request(skill: &str) -> ApprovalRequest {
        ApprovalRequest::new(skill, json!({"path": "notes/todo.md", "content": "x"}))
            .requested_by("react")
            .trust_level("observe")
            .reason_codes(vec!["trust_below_minimum".into()])
    }

    #[test]
    fn test_enqueue_and_list() {
        let queue = ApprovalQueue::in_memory().unwrap();
        let a = queue.enqueue(request("fs_write")).unwrap();
        let b = queue.enqueue(request("shell_exec")).unwrap();
        assert!(a.starts_with("appr_"));

        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec![a.clone(), b]);
        let item = queue.get(&a).unwrap();
        assert_eq!(item.skill_id, "fs_write");
        assert_eq!(item.inputs["path"], "notes/todo.md");
        assert_eq!(item.reason_codes, vec!["trust_below_minimum"]);
        assert_eq!(item.status, ApprovalStatus::Pending);
        assert!(item.decided_by.is_none());
    }

    #[test]
    fn test_second_decision_is_already_decided() {
        let queue = ApprovalQueue::in_memory().unwrap();
        let id = queue.enqueue(request("fs_write")).unwrap();

        let item = queue.transition(&id, ApprovalStatus::Approved, "alice").unwrap();
        assert_eq!(item.status, ApprovalStatus::Approved);
        assert_eq!(item.decided_by.as_deref(), Some("alice"));

        let err = queue.transition(&id, ApprovalStatus::Rejected, "bob").unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::AlreadyDecided { status: ApprovalStatus::Approved, .. }
        ));
        assert_eq!(queue.get(&id).unwrap().decided_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_unknown_id_and_invalid_target() {
        let queue = ApprovalQueue::in_memory().unwrap();
        assert!(matches!(
            queue.transition("appr_nope", ApprovalStatus::Approved, "alice"),
            Err(ApprovalError::NotFound(_))
        ));
        let id = queue.enqueue(request("fs_write")).unwrap();
        assert!(matches!(
            queue.transition(&id, ApprovalStatus::Pending, "alice"),
            Err(ApprovalError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_concurrent_decisions_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.db");
        let id = ApprovalQueue::open(&path).unwrap().enqueue(request("fs_write")).unwrap();

        // 每个线程一个独立连接，模拟多个进程
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    let queue = ApprovalQueue::open(&path).unwrap();
                    let to = if i % 2 == 0 {
                        ApprovalStatus::Approved
                    } else {
                        ApprovalStatus::Rejected
                    };
                    queue.transition(&id, to, &format!("actor{}", i)).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_expire_and_prune() {
        let queue = Arc::new(ApprovalQueue::in_memory().unwrap());
        let old = queue.enqueue(request("fs_write")).unwrap();
        let decided = queue.enqueue(request("fs_write")).unwrap();
        queue.transition(&decided, ApprovalStatus::Rejected, "alice").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let expired = queue.expire(later, later).unwrap();
        assert_eq!(expired, vec![old.clone()]);
        let item = queue.get(&old).unwrap();
        assert_eq!(item.status, ApprovalStatus::Expired);
        assert_eq!(item.decided_by.as_deref(), Some(EXPIRY_ACTOR));
        assert_eq!(item.decided_at, Some(later.timestamp_millis()));
        assert!(matches!(
            queue.transition(&old, ApprovalStatus::Approved, "alice"),
            Err(ApprovalError::AlreadyDecided { .. })
        ));

        let fresh = queue.enqueue(request("fs_write")).unwrap();
        assert!(queue.expire(Utc::now() - chrono::Duration::hours(1), Utc::now()).unwrap().is_empty());

        assert_eq!(queue.prune(later + chrono::Duration::seconds(1)).unwrap(), 2);
        let left = queue.list(None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh);
    }

    #[test]
    fn test_record_result() {
        let queue = ApprovalQueue::in_memory().unwrap();
        let id = queue.enqueue(request("fs_write")).unwrap();
        queue.transition(&id, ApprovalStatus::Approved, "alice").unwrap();
        queue.record_result(&id, &json!({"ok": true, "bytes": 1})).unwrap();
        assert_eq!(queue.get(&id).unwrap().result, Some(json!({"ok": true, "bytes": 1})));
    }
}
