//! 技能沙箱
//!
//! - 路径：词法规整后对已存在的前缀 canonicalize（解析符号链接），结果必须落在某个 allowed 目录下
//! - 命令：拒绝任何 shell 元字符，首词（或多词前缀）必须与白名单条目完全一致；
//!   通过检查后按空白切分为 argv 直接执行，不经过 shell

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// 即使首词在白名单中也拒绝的子串
const FORBIDDEN_SUBSTR: &[&str] = &["rm -rf", "rm -fr", "chmod 777", "chmod +s", "mkfs", "dd if="];

static METACHAR_RE: OnceLock<Regex> = OnceLock::new();

fn metachar_re() -> &'static Regex {
    METACHAR_RE.get_or_init(|| Regex::new(r#"[;&|`$<>(){}\[\]\\*?~!'"\n\r]"#).unwrap())
}

/// 去掉 `.`、折叠 `..`（不访问文件系统）
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 对最长的已存在前缀 canonicalize，再拼回不存在的部分
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// 把 `raw` 解析为 allowed 目录内的绝对路径
///
/// 相对路径以第一个 allowed 目录为基准；allowed 为空时一律拒绝。
pub fn resolve_within(raw: &str, allowed: &[PathBuf]) -> Result<PathBuf, String> {
    let Some(base) = allowed.first() else {
        return Err("no allowed directories configured".to_string());
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty path".to_string());
    }

    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let resolved = canonicalize_existing_prefix(&normalize(&joined));

    let inside = allowed.iter().any(|dir| {
        let root = canonicalize_existing_prefix(&normalize(dir));
        resolved.starts_with(&root)
    });
    if inside {
        Ok(resolved)
    } else {
        Err(format!("path '{}' resolves outside allowed directories", raw))
    }
}

/// 校验命令并返回 argv
pub fn check_command(raw: &str, whitelist: &[String]) -> Result<Vec<String>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty command".to_string());
    }
    if let Some(m) = metachar_re().find(raw) {
        return Err(format!("shell metacharacter '{}' is not allowed", m.as_str().escape_default()));
    }
    let lower = raw.to_lowercase();
    if let Some(bad) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
        return Err(format!("forbidden pattern '{}'", bad));
    }

    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    let allowed = whitelist.iter().any(|entry| {
        let prefix: Vec<&str> = entry.split_whitespace().collect();
        !prefix.is_empty()
            && prefix.len() <= argv.len()
            && prefix.iter().zip(&argv).all(|(a, b)| *a == b.as_str())
    });
    if allowed {
        Ok(argv)
    } else {
        Err(format!("command '{}' is not in the whitelist", argv[0]))
    }
}
