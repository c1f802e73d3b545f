//! 統合結果の永続化
//!
//! ジョブごとに1つのJSONファイルへ保存する。上書き前に旧ファイルを
//! `backups/` へ退避し、書き込みは一時ファイル経由のリネームで行う。

use bunch_ai_common::ConsolidatedResult;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::analyzer::artifact::sanitize_file_component;
use crate::error::{BunchAiError, Result};

const BACKUP_DIR_NAME: &str = "backups";

/// 統合結果の保存先
pub trait ResultStore: Send + Sync {
    fn load(&self, job_id: &str) -> Result<Option<ConsolidatedResult>>;
    fn save(&self, job_id: &str, result: &ConsolidatedResult) -> Result<()>;
    /// 削除した場合 true
    fn delete(&self, job_id: &str) -> Result<bool>;
}

/// JSONファイルによる実装
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    dir: PathBuf,
}

/// ジョブIDをそのままファイル名に使えるか（置換が必要なIDは別IDと衝突し得る）
pub fn is_storable_job_id(job_id: &str) -> bool {
    !job_id.is_empty() && !job_id.starts_with('.') && sanitize_file_component(job_id) == job_id
}

/// ジョブIDから安全なファイル名の幹を作る
fn file_stem(job_id: &str) -> String {
    let stem = sanitize_file_component(job_id.trim());
    if stem.starts_with('.') {
        format!("_{}", stem)
    } else {
        stem
    }
}

impl JsonResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(job_id)))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR_NAME)
    }

    /// 既存ファイルを `backups/<job>_<YYYYmmdd_HHMMSS>.json` へ複製
    fn backup(&self, job_id: &str, current: &Path) -> Result<PathBuf> {
        let backup_dir = self.backup_dir();
        std::fs::create_dir_all(&backup_dir)?;

        let base = format!(
            "{}_{}",
            file_stem(job_id),
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let mut target = backup_dir.join(format!("{}.json", base));
        let mut n = 1;
        while target.exists() {
            target = backup_dir.join(format!("{}_{}.json", base, n));
            n += 1;
        }

        std::fs::copy(current, &target)?;
        tracing::debug!(job_id, backup = %target.display(), "旧結果をバックアップ");
        Ok(target)
    }
}

impl ResultStore for JsonResultStore {
    fn load(&self, job_id: &str) -> Result<Option<ConsolidatedResult>> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let result: ConsolidatedResult = serde_json::from_reader(reader)
            .map_err(|e| BunchAiError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(Some(result))
    }

    fn save(&self, job_id: &str, result: &ConsolidatedResult) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(job_id);

        if path.exists() {
            self.backup(job_id, &path)?;
        }

        let temp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, result)?;
            writer.flush()?;
        }
        temp.persist(&path).map_err(|e| BunchAiError::Io(e.error))?;

        tracing::info!(job_id, path = %path.display(), "結果を保存");
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<bool> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        tracing::info!(job_id, "結果を削除");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("G-001"), "G-001");
        assert_eq!(file_stem("lote/7"), "lote_7");
        assert_eq!(file_stem("../x"), "_.._x");
    }

    #[test]
    fn test_storable_job_id() {
        assert!(is_storable_job_id("G-001"));
        assert!(is_storable_job_id("lote_7"));
        assert!(!is_storable_job_id("lote/7"));
        assert!(!is_storable_job_id("a|b"));
        assert!(!is_storable_job_id(".hidden"));
        assert!(!is_storable_job_id(""));
    }
}
