//! 内置技能

pub mod filesystem;
pub mod shell;

use std::path::PathBuf;

pub use filesystem::{FsListSkill, FsReadSkill, FsWriteSkill};
pub use shell::ShellExecSkill;

use crate::skills::registry::SkillRegistry;

/// 注册全部内置技能
pub fn register_builtin(
    registry: &SkillRegistry,
    allowed_directories: Vec<PathBuf>,
    command_whitelist: Vec<String>,
    shell_timeout_secs: u64,
) {
    registry.register(FsReadSkill::new(allowed_directories.clone()));
    registry.register(FsListSkill::new(allowed_directories.clone()));
    registry.register(FsWriteSkill::new(allowed_directories.clone()));
    registry.register(ShellExecSkill::new(
        allowed_directories,
        command_whitelist,
        shell_timeout_secs,
    ));
}
