//! shell_exec：白名单命令，按 argv 直接启动（不经过 sh -c），带超时

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::skills::manifest::{Cost, FieldType, Risk, SkillCategory, SkillManifest, TrustLevel};
use crate::skills::registry::Skill;
use crate::skills::sandbox::{check_command, resolve_within};

/// stdout / stderr 各自保留的最大字符数
const MAX_STREAM_CHARS: usize = 16 * 1024;

pub struct ShellExecSkill {
    manifest: SkillManifest,
    timeout: Duration,
}

impl ShellExecSkill {
    pub fn new(allowed: Vec<PathBuf>, whitelist: Vec<String>, timeout_secs: u64) -> Self {
        let manifest = SkillManifest::new("shell_exec", SkillCategory::Shell)
            .description("Run a whitelisted command (no shell syntax) inside the workspace.")
            .input("command", FieldType::String, true, "command line, first word must be whitelisted")
            .input("cwd", FieldType::Path, false, "working directory, default the workspace root")
            .output("exitCode", FieldType::Integer, "process exit code")
            .output("stdout", FieldType::String, "captured stdout")
            .output("stderr", FieldType::String, "captured stderr")
            .risk(Risk::High)
            .cost(Cost::Cheap)
            .min_trust(TrustLevel::BoundedAuto)
            .requires_approval(true)
            .allowed_directories(allowed)
            .command_whitelist(whitelist);
        Self {
            manifest,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > MAX_STREAM_CHARS {
        format!("{}...[truncated]", text.chars().take(MAX_STREAM_CHARS).collect::<String>())
    } else {
        text.into_owned()
    }
}

#[async_trait]
impl Skill for ShellExecSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: Value) -> Result<Value, String> {
        let command = inputs
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "'command' must be a string".to_string())?;
        let argv = check_command(command, &self.manifest.command_whitelist)?;
        let cwd = match inputs.get("cwd").and_then(Value::as_str) {
            Some(raw) => resolve_within(raw, &self.manifest.allowed_directories)?,
            None => resolve_within(".", &self.manifest.allowed_directories)?,
        };

        tracing::info!(command = %command, cwd = %cwd.display(), "shell_exec execute");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&cwd).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("failed to start '{}': {}", argv[0], e))?;

        let stdout = clip(&output.stdout);
        let stderr = clip(&output.stderr);
        if !output.status.success() {
            return Err(format!(
                "exit {}\nstderr: {}",
                output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                stderr.trim()
            ));
        }
        Ok(json!({
            "exitCode": output.status.code().unwrap_or(0),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_whitelisted_command_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let skill = ShellExecSkill::new(vec![dir.path().to_path_buf()], vec!["ls".into()], 5);
        let out = skill.execute(json!({"command": "ls"})).await.unwrap();
        assert_eq!(out["exitCode"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_rejects_unlisted_and_shell_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let skill = ShellExecSkill::new(vec![dir.path().to_path_buf()], vec!["ls".into()], 5);
        assert!(skill.execute(json!({"command": "rm x"})).await.is_err());
        assert!(skill.execute(json!({"command": "ls && rm x"})).await.is_err());
        assert!(skill
            .execute(json!({"command": "ls", "cwd": "../.."}))
            .await
            .is_err());
    }

    #[test]
    fn test_manifest_requires_approval() {
        let skill = ShellExecSkill::new(vec![], vec![], 5);
        assert!(skill.manifest().requires_approval);
        assert_eq!(skill.manifest().min_trust_level, TrustLevel::BoundedAuto);
        assert_eq!(skill.manifest().risk, Risk::High);
    }
}
