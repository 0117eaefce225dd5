//! 文件系统技能：fs_read / fs_list / fs_write
//!
//! 执行器已把 path 字段解析到 allowed 目录内；这里仍按清单的目录再校验一次。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use crate::skills::manifest::{Cost, FieldType, Risk, SkillCategory, SkillManifest, TrustLevel};
use crate::skills::registry::Skill;
use crate::skills::sandbox::resolve_within;

/// 单次读取的默认上限
const DEFAULT_MAX_BYTES: u64 = 64 * 1024;

fn resolve(manifest: &SkillManifest, inputs: &Value, field: &str) -> Result<PathBuf, String> {
    let raw = inputs
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("'{}' must be a string", field))?;
    resolve_within(raw, &manifest.allowed_directories)
}

fn display(manifest: &SkillManifest, path: &Path) -> String {
    manifest
        .allowed_directories
        .iter()
        .find_map(|root| {
            let root = root.canonicalize().unwrap_or_else(|_| root.clone());
            path.strip_prefix(&root).ok().map(|p| p.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

pub struct FsReadSkill {
    manifest: SkillManifest,
}

impl FsReadSkill {
    pub fn new(allowed: Vec<PathBuf>) -> Self {
        let manifest = SkillManifest::new("fs_read", SkillCategory::Fs)
            .description("Read a UTF-8 text file inside the workspace.")
            .input("path", FieldType::Path, true, "file path, relative to the workspace")
            .input("maxBytes", FieldType::Integer, false, "read at most this many bytes (default 65536)")
            .output("content", FieldType::String, "file content")
            .output("truncated", FieldType::Boolean, "true when the file was longer than maxBytes")
            .min_trust(TrustLevel::Observe)
            .allowed_directories(allowed);
        Self { manifest }
    }
}

#[async_trait]
impl Skill for FsReadSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: Value) -> Result<Value, String> {
        let path = resolve(&self.manifest, &inputs, "path")?;
        let max = inputs
            .get("maxBytes")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_BYTES) as usize;
        tracing::info!(path = %path.display(), "fs_read execute");

        let shown = display(&self.manifest, &path);
        let read_err = |e: std::io::Error| format!("read {} failed: {}", shown, e);
        let file = tokio::fs::File::open(&path).await.map_err(read_err)?;
        let size = file.metadata().await.map_err(read_err)?.len();

        // 多读一个字节判断是否截断，内存占用不超过 max + 1
        let mut buf = Vec::with_capacity(max.min(DEFAULT_MAX_BYTES as usize) + 1);
        file.take(max as u64 + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(read_err)?;
        let truncated = buf.len() > max;
        buf.truncate(max);
        Ok(json!({
            "path": shown,
            "content": String::from_utf8_lossy(&buf),
            "bytes": size,
            "truncated": truncated,
        }))
    }
}

pub struct FsListSkill {
    manifest: SkillManifest,
}

impl FsListSkill {
    pub fn new(allowed: Vec<PathBuf>) -> Self {
        let manifest = SkillManifest::new("fs_list", SkillCategory::Fs)
            .description("List a directory inside the workspace (hidden entries skipped).")
            .input("path", FieldType::Path, false, "directory path, default the workspace root")
            .output("entries", FieldType::Array, "sorted names, directories end with '/'")
            .min_trust(TrustLevel::Observe)
            .allowed_directories(allowed);
        Self { manifest }
    }
}

#[async_trait]
impl Skill for FsListSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: Value) -> Result<Value, String> {
        let dir = match inputs.get("path") {
            Some(Value::String(_)) => resolve(&self.manifest, &inputs, "path")?,
            _ => resolve_within(".", &self.manifest.allowed_directories)?,
        };
        tracing::info!(path = %dir.display(), "fs_list execute");

        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| format!("list {} failed: {}", display(&self.manifest, &dir), e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| e.to_string())? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(json!({ "path": display(&self.manifest, &dir), "entries": entries }))
    }
}

pub struct FsWriteSkill {
    manifest: SkillManifest,
}

impl FsWriteSkill {
    pub fn new(allowed: Vec<PathBuf>) -> Self {
        let manifest = SkillManifest::new("fs_write", SkillCategory::Fs)
            .description("Write a text file inside the workspace; parent directories are created.")
            .input("path", FieldType::Path, true, "file path, relative to the workspace")
            .input("content", FieldType::String, true, "file content")
            .input("overwrite", FieldType::Boolean, false, "replace an existing file (default false)")
            .output("bytes", FieldType::Integer, "bytes written")
            .risk(Risk::Medium)
            .cost(Cost::Free)
            .min_trust(TrustLevel::SupervisedAuto)
            .allowed_directories(allowed);
        Self { manifest }
    }
}

#[async_trait]
impl Skill for FsWriteSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: Value) -> Result<Value, String> {
        let path = resolve(&self.manifest, &inputs, "path")?;
        let content = inputs
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| "'content' must be a string".to_string())?;
        let overwrite = inputs.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
        let shown = display(&self.manifest, &path);

        if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(format!("{} already exists (set overwrite=true to replace)", shown));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("create {} failed: {}", parent.display(), e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| format!("write {} failed: {}", shown, e))?;
        tracing::info!(path = %path.display(), bytes = content.len(), "fs_write execute");
        Ok(json!({ "path": shown, "bytes": content.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let allowed = vec![dir.path().to_path_buf()];
        (dir, allowed)
    }

    #[tokio::test]
    async fn test_write_then_read_and_list() {
        let (_dir, allowed) = roots();
        let write = FsWriteSkill::new(allowed.clone());
        let out = write
            .execute(json!({"path": "notes/todo.md", "content": "- ship it"}))
            .await
            .unwrap();
        assert_eq!(out["bytes"], 9);
        assert_eq!(out["path"], "notes/todo.md");

        let read = FsReadSkill::new(allowed.clone());
        let out = read.execute(json!({"path": "notes/todo.md", "maxBytes": 4})).await.unwrap();
        assert_eq!(out["content"], "- sh");
        assert_eq!(out["truncated"], true);

        let list = FsListSkill::new(allowed);
        let out = list.execute(json!({})).await.unwrap();
        assert_eq!(out["entries"], json!(["notes/"]));
    }

    #[tokio::test]
    async fn test_write_refuses_overwrite_by_default() {
        let (_dir, allowed) = roots();
        let write = FsWriteSkill::new(allowed);
        write.execute(json!({"path": "a.txt", "content": "1"})).await.unwrap();
        assert!(write.execute(json!({"path": "a.txt", "content": "2"})).await.is_err());
        assert!(write
            .execute(json!({"path": "a.txt", "content": "2", "overwrite": true}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_read_stops_at_max_bytes() {
        let (dir, allowed) = roots();
        std::fs::write(dir.path().join("big.log"), vec![b'x'; 1 << 20]).unwrap();
        std::fs::write(dir.path().join("exact.txt"), "12345").unwrap();
        let read = FsReadSkill::new(allowed);

        let out = read.execute(json!({"path": "big.log", "maxBytes": 10})).await.unwrap();
        assert_eq!(out["content"], "xxxxxxxxxx");
        assert_eq!(out["bytes"], 1 << 20);
        assert_eq!(out["truncated"], true);

        let out = read.execute(json!({"path": "exact.txt", "maxBytes": 5})).await.unwrap();
        assert_eq!(out["content"], "12345");
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn test_skills_recheck_sandbox() {
        let (_dir, allowed) = roots();
        let read = FsReadSkill::new(allowed);
        assert!(read.execute(json!({"path": "/etc/hostname"})).await.is_err());
        assert!(read.execute(json!({"path": "../x"})).await.is_err());
    }
}
