//! 记忆持久化
//!
//! 将情景与语义记忆写入/从 JSON 文件加载，用于跨进程恢复（由宿主选择是否启用）。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::{Episode, Insight};

const SNAPSHOT_VERSION: u32 = 1;

/// 情景 + 语义记忆快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub episodes: Vec<Episode>,
    pub insights: Vec<Insight>,
}

impl MemorySnapshot {
    pub fn new(episodes: Vec<Episode>, insights: Vec<Insight>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp_millis(),
            episodes,
            insights,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty() && self.insights.is_empty()
    }
}

/// 单文件 JSON 持久化
#[derive(Debug, Clone)]
pub struct MemoryPersistence {
    path: PathBuf,
}

impl MemoryPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照；文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<MemorySnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let snapshot: MemorySnapshot = serde_json::from_str(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported memory snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(Some(snapshot))
    }

    /// 写入快照；父目录不存在时自动创建
    pub fn save(&self, snapshot: &MemorySnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DecisionResult, InvocationError};
    use crate::memory::ContextLabel;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let p = MemoryPersistence::new(dir.path().join("nope.json"));
        assert!(p.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = MemoryPersistence::new(dir.path().join("nested/memory.json"));
        let result = DecisionResult::failed("dx", "x", InvocationError::Timeout { after_ms: 1 }, 1);
        let snapshot = MemorySnapshot::new(
            vec![Episode::from_result(&result, ContextLabel::Routine)],
            vec![],
        );
        p.save(&snapshot).unwrap();
        assert_eq!(p.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "saved_at": 0, "episodes": [], "insights": []}"#,
        )
        .unwrap();
        assert!(MemoryPersistence::new(path).load().is_err());
    }
}
