//! 用户活跃信号：距上次活跃的秒数

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub trait ActivitySource: Send + Sync {
    fn inactivity_secs(&self) -> u64;
}

/// 以标记文件的 mtime 作为最近一次活跃时间
///
/// 前端在用户操作时 touch 该文件；文件不存在视为自进程启动起一直空闲。
pub struct FileActivitySource {
    path: PathBuf,
    started: SystemTime,
}

impl FileActivitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            started: SystemTime::now(),
        }
    }
}

impl ActivitySource for FileActivitySource {
    fn inactivity_secs(&self) -> u64 {
        let last = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .unwrap_or(self.started);
        SystemTime::now()
            .duration_since(last)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// 记录一次活跃（创建或更新标记文件）
pub fn touch(path: impl Into<PathBuf>) -> std::io::Result<()> {
    let path = path.into();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.set_modified(SystemTime::now())
}

/// 固定值，测试与无前端场景使用
#[derive(Debug, Default)]
pub struct FixedActivity(AtomicU64);

impl FixedActivity {
    pub fn new(inactivity_secs: u64) -> Self {
        Self(AtomicU64::new(inactivity_secs))
    }

    pub fn set(&self, inactivity_secs: u64) {
        self.0.store(inactivity_secs, Ordering::SeqCst);
    }
}

impl ActivitySource for FixedActivity {
    fn inactivity_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_file_activity_tracks_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity");
        let source = FileActivitySource::new(&path);
        assert_eq!(source.inactivity_secs(), 0);

        touch(&path).unwrap();
        let old = SystemTime::now() - Duration::from_secs(900);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(source.inactivity_secs() >= 899);

        touch(&path).unwrap();
        assert!(source.inactivity_secs() < 5);
    }

    #[test]
    fn test_fixed_activity() {
        let a = FixedActivity::new(10);
        assert_eq!(a.inactivity_secs(), 10);
        a.set(0);
        assert_eq!(a.inactivity_secs(), 0);
    }
}
