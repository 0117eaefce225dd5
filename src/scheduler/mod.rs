//! 后台 agent 调度
//!
//! - **spec**: agents.json 配置模型与解析
//! - **trigger**: 触发器求值与全局闸门（纯函数）
//! - **lock**: 单实例文件锁与存活探测
//! - **launcher**: agent 进程启动
//! - **state**: 运行统计与持久化
//! - **activity**: 用户活跃信号
//! - **watcher**: 配置热更新事件源
//! - **engine**: 调度引擎

pub mod activity;
pub mod engine;
pub mod launcher;
pub mod lock;
pub mod spec;
pub mod state;
pub mod trigger;
pub mod watcher;

pub use activity::{ActivitySource, FileActivitySource, FixedActivity};
pub use engine::{
    backoff_delay, AgentStatus, Clock, ManualClock, ReloadReport, Scheduler, SchedulerCleanup,
    SchedulerOptions, SystemClock, TickHook, TickReport,
};
pub use launcher::{AgentLauncher, LaunchError, ProcessLauncher};
pub use lock::{AcquireOutcome, LockError, LockManager, LockRecord, LockToken, OsProcessProbe, ProcessProbe};
pub use spec::{AgentSpec, ConfigError, GlobalSettings, Priority, SchedulerConfig, Trigger};
pub use state::{AgentPhase, AgentRunStats, StateStore};
pub use trigger::{apply_gates, should_fire, GateVeto, RunningCounts, TriggerEvalError, TriggerState};
pub use watcher::{ConfigChanged, ConfigWatcher};
