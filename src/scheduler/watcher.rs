//! 配置文件热更新：轮询 (mtime, len) 指纹，文件稳定 debounce 时长后发出 ConfigChanged

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChanged {
    pub path: PathBuf,
}

type Fingerprint = Option<(SystemTime, u64)>;

fn fingerprint(path: &Path) -> Fingerprint {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

pub struct ConfigWatcher {
    path: PathBuf,
    poll: Duration,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_ms: u64, debounce_ms: u64) -> Self {
        Self {
            path: path.into(),
            poll: Duration::from_millis(poll_ms.max(10)),
            debounce: Duration::from_millis(debounce_ms),
        }
    }

    /// 启动后台轮询，cancel 后退出
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<ConfigChanged>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<ConfigChanged>, cancel: CancellationToken) {
        let mut current = fingerprint(&self.path);
        let mut pending: Option<(Fingerprint, Instant)> = None;
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(path = %self.path.display(), "Config watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let seen = fingerprint(&self.path);
            match pending.take() {
                Some((fp, since)) if fp == seen => {
                    if since.elapsed() >= self.debounce {
                        current = seen;
                        tracing::info!(path = %self.path.display(), "Config file changed");
                        let event = ConfigChanged {
                            path: self.path.clone(),
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    } else {
                        pending = Some((fp, since));
                    }
                }
                _ if seen != current => pending = Some((seen, Instant::now())),
                _ => {}
            }
        }
        tracing::debug!(path = %self.path.display(), "Config watcher stopped");
    }
}
