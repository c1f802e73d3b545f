//! ジョブ進捗ストア
//!
//! ワーカーとポーリング側で共有される唯一の状態。
//! 更新は必ずメソッド経由で行い、状態遷移と進捗の単調性をここで保証する。

use bunch_ai_common::{ErrorKind, JobState, ProcessingStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<HashMap<String, ProcessingStatus>>>,
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

/// 写真 `index`（1始まり）処理開始時の進捗
pub fn photo_progress(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 5;
    }
    let done = index.saturating_sub(1).min(total);
    (5 + 90 * done / total) as u8
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessingStatus>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新しい実行を pending で登録する
    ///
    /// 同じジョブIDが pending/processing の場合は false。終端状態は上書きする。
    pub fn insert_pending(&self, job_id: &str, total: usize) -> bool {
        let mut map = self.lock();
        if map.get(job_id).is_some_and(|s| !s.is_terminal()) {
            return false;
        }
        let mut status = ProcessingStatus::pending(total);
        status.updated_at = now();
        map.insert(job_id.to_string(), status);
        true
    }

    /// 投入に失敗したジョブの登録を取り消す
    pub(crate) fn discard(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.lock().get(job_id).is_some_and(|s| !s.is_terminal())
    }

    /// 状態を更新する
    ///
    /// 終端状態や逆方向の遷移は拒否し、進捗とステップは減少させない。
    pub fn update<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ProcessingStatus),
    {
        let mut map = self.lock();
        let Some(current) = map.get_mut(job_id) else {
            return false;
        };
        if current.is_terminal() {
            tracing::debug!(job_id, state = %current.state, "終端状態のため更新を無視");
            return false;
        }

        let mut next = current.clone();
        f(&mut next);
        if !current.state.can_transition_to(next.state) {
            tracing::warn!(job_id, from = %current.state, to = %next.state, "不正な状態遷移を拒否");
            return false;
        }
        next.progress = next.progress.max(current.progress).min(100);
        next.step = next.step.max(current.step);
        next.updated_at = now();
        *current = next;
        true
    }

    /// 写真の処理開始を記録
    pub fn start_photo(&self, job_id: &str, index: usize, total: usize, file_name: &str) -> bool {
        self.update(job_id, |s| {
            s.state = JobState::Processing;
            s.step = ProcessingStatus::STEP_ANALYZING;
            s.progress = photo_progress(index, total);
            s.processed = index.saturating_sub(1);
            s.total = total;
            s.message = format!("写真 {}/{} を解析中: {}", index, total, file_name);
        })
    }

    pub fn photo_done(&self, job_id: &str, processed: usize) -> bool {
        self.update(job_id, |s| s.processed = s.processed.max(processed))
    }

    pub fn set_step(&self, job_id: &str, step: u8, progress: u8, message: &str) -> bool {
        self.update(job_id, |s| {
            s.state = JobState::Processing;
            s.step = step;
            s.progress = progress;
            s.message = message.to_string();
        })
    }

    pub fn complete(&self, job_id: &str, total_detected: u32, message: &str) -> bool {
        self.update(job_id, |s| {
            s.state = JobState::Completed;
            s.step = ProcessingStatus::STEP_DONE;
            s.progress = 100;
            s.processed = s.total;
            s.total_detected = Some(total_detected);
            s.message = message.to_string();
        })
    }

    pub fn fail(&self, job_id: &str, kind: ErrorKind, message: &str) -> bool {
        self.update(job_id, |s| {
            s.state = JobState::Error;
            s.error_kind = Some(kind);
            s.message = message.to_string();
        })
    }

    /// 現在の状態を取得（削除しない）
    pub fn poll(&self, job_id: &str) -> Option<ProcessingStatus> {
        self.lock().get(job_id).cloned()
    }

    /// 終端状態を確認済みとして削除
    pub fn acknowledge(&self, job_id: &str) -> bool {
        let mut map = self.lock();
        if map.get(job_id).is_some_and(|s| s.is_terminal()) {
            map.remove(job_id);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ProcessingStatus)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
