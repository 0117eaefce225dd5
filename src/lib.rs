//! Hive - 自治 agent 调度与推理操作器
//!
//! 模块划分：
//! - **approval**: 持久化审批队列（SQLite）
//! - **audit**: 审计接口与 sink
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 组件装配与优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **react**: Planner、scratchpad、失败循环检测、ReAct 主循环
//! - **scheduler**: 触发器、闸门、单实例锁、进程启动、热更新与调度引擎
//! - **skills**: 技能清单、注册表、沙箱、审批策略与执行器

pub mod approval;
pub mod audit;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod scheduler;
pub mod skills;

pub use crate::core::{Hive, HiveBuilder};
