//! 核心装配层：组件构建与优雅关闭

pub mod builder;
pub mod shutdown;

pub use builder::{ApprovalMaintenance, BuildError, Hive, HiveBuilder};
pub use shutdown::{CleanupResult, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
