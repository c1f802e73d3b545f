//! ジョブコーディネーター
//!
//! 有限キューと固定数のワーカータスクでジョブを処理する。投入は即座に返り、
//! 呼び出し側は `StatusStore` をポーリングして進捗を確認する。
//!
//! 1ジョブの流れ:
//! 1. 準備（pending → processing）
//! 2. 写真ループ（番号順）
//! 3. 集計
//! 4. 保存済みレコードとのマージと保存（ジョブ単位のロック下）
//! 5. 完了またはエラー

use bunch_ai_common::{
    merge_results, CategoryAliases, ConsolidatedResult, ErrorKind, JobState, ManualClassification,
    ProcessingStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analyzer::{DetectionServiceClient, LoopOutcome, PhotoWorker, WorkerSettings};
use crate::config::Config;
use crate::error::{BunchAiError, Result};
use crate::status::StatusStore;
use crate::store::{is_storable_job_id, ResultStore};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// コーディネーターの設定
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_photos_per_job: usize,
    pub model_id: String,
    pub worker: WorkerSettings,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            max_photos_per_job: config.max_photos_per_job,
            model_id: config.model_id.clone(),
            worker: WorkerSettings {
                max_image_width: config.max_image_width,
                max_image_height: config.max_image_height,
                artifact_dir: config.artifact_dir.clone(),
            },
        }
    }
}

/// キューに積まれる1ジョブ
#[derive(Debug)]
pub struct ClassificationJob {
    pub job_id: String,
    pub photos: Vec<PathBuf>,
    pub manual: ManualClassification,
    pub started: Instant,
    pub cancel: CancellationToken,
    /// 同じジョブIDの再投入と区別する実行番号
    pub run_id: u64,
}

/// 投入済みジョブへの参照
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: String,
    status: StatusStore,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> Option<ProcessingStatus> {
        self.status.poll(&self.job_id)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 終端状態になるまで待つ（確認済みで削除された場合は None）
    pub async fn wait(&self) -> Option<ProcessingStatus> {
        loop {
            let status = self.status.poll(&self.job_id)?;
            if status.is_terminal() {
                return Some(status);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// 実行中ジョブのキャンセルトークン
#[derive(Debug)]
struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
}

type ActiveTokens = Arc<Mutex<HashMap<String, ActiveRun>>>;
type JobLock = Arc<tokio::sync::Mutex<()>>;

/// ワーカータスク間で共有される実行コンテキスト
struct JobRunner {
    worker: PhotoWorker,
    store: Arc<dyn ResultStore>,
    status: StatusStore,
    active: ActiveTokens,
    locks: Mutex<HashMap<String, JobLock>>,
    model_id: String,
}

pub struct JobCoordinator {
    sender: mpsc::Sender<ClassificationJob>,
    status: StatusStore,
    active: ActiveTokens,
    next_run_id: AtomicU64,
    max_photos_per_job: usize,
    queue_capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl JobCoordinator {
    /// ワーカータスクを起動する（tokioランタイム内で呼ぶこと）
    pub fn new(
        settings: CoordinatorSettings,
        client: Arc<dyn DetectionServiceClient>,
        store: Arc<dyn ResultStore>,
        aliases: Arc<CategoryAliases>,
        status: StatusStore,
    ) -> Self {
        let queue_capacity = settings.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel::<ClassificationJob>(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let active: ActiveTokens = Arc::default();

        let runner = Arc::new(JobRunner {
            worker: PhotoWorker::new(client, aliases, settings.worker),
            store,
            status: status.clone(),
            active: active.clone(),
            locks: Mutex::new(HashMap::new()),
            model_id: settings.model_id,
        });

        let worker_count = settings.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => runner.run(job).await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker_id, "ワーカー終了");
                })
            })
            .collect();

        info!(worker_count, queue_capacity, "コーディネーター起動");

        Self {
            sender,
            status,
            active,
            next_run_id: AtomicU64::new(1),
            max_photos_per_job: settings.max_photos_per_job.max(1),
            queue_capacity,
            workers,
        }
    }

    /// ジョブを投入する
    ///
    /// 投入時に判定できるエラーのみ同期的に返す。実行時のエラーは
    /// 写真単位の結果か終端状態に記録される。
    pub fn submit(
        &self,
        job_id: &str,
        mut photos: Vec<PathBuf>,
        manual: Option<ManualClassification>,
    ) -> Result<JobHandle> {
        let job_id = job_id.trim();
        if !is_storable_job_id(job_id) {
            return Err(BunchAiError::InvalidJobId(job_id.to_string()));
        }
        if photos.is_empty() {
            return Err(BunchAiError::NoPhotos);
        }
        if photos.len() > self.max_photos_per_job {
            warn!(
                job_id,
                submitted = photos.len(),
                limit = self.max_photos_per_job,
                "上限を超えた写真は処理しません"
            );
            photos.truncate(self.max_photos_per_job);
        }

        if !self.status.insert_pending(job_id, photos.len()) {
            return Err(BunchAiError::JobAlreadyActive(job_id.to_string()));
        }

        let cancel = CancellationToken::new();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().unwrap_or_else(PoisonError::into_inner).insert(
            job_id.to_string(),
            ActiveRun {
                run_id,
                token: cancel.clone(),
            },
        );

        let job = ClassificationJob {
            job_id: job_id.to_string(),
            photos,
            manual: manual.unwrap_or_default(),
            started: Instant::now(),
            cancel: cancel.clone(),
            run_id,
        };

        if let Err(e) = self.sender.try_send(job) {
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(job_id);
            self.status.discard(job_id);
            return Err(match e {
                TrySendError::Full(_) => BunchAiError::QueueFull(self.queue_capacity),
                TrySendError::Closed(_) => BunchAiError::Config("ワーカーが停止しています".into()),
            });
        }

        info!(job_id, "ジョブを投入");
        Ok(JobHandle {
            job_id: job_id.to_string(),
            status: self.status.clone(),
            cancel,
        })
    }

    /// ジョブを投入してIDを返す
    pub fn start_job(
        &self,
        job_id: &str,
        photos: Vec<PathBuf>,
        manual: Option<ManualClassification>,
    ) -> Result<String> {
        self.submit(job_id, photos, manual)
            .map(|handle| handle.job_id().to_string())
    }

    pub fn poll_status(&self, job_id: &str) -> Result<ProcessingStatus> {
        self.status
            .poll(job_id)
            .ok_or_else(|| BunchAiError::JobNotFound(job_id.to_string()))
    }

    /// 終端状態を確認済みにして削除
    pub fn acknowledge(&self, job_id: &str) -> bool {
        self.status.acknowledge(job_id)
    }

    /// 実行中のジョブをキャンセル（写真単位で反映）
    pub fn cancel(&self, job_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(job_id) {
            Some(run) => {
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    /// キューを閉じ、処理中のジョブが終わるまで待つ
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "ワーカータスクが異常終了");
            }
        }
    }
}

impl JobRunner {
    fn job_lock(&self, job_id: &str) -> JobLock {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// 他に使っているタスクがなければロックを表から外す
    fn release_job_lock(&self, job_id: &str, lock: JobLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 表の分と手元の分のみ
        if Arc::strong_count(&lock) == 2 {
            locks.remove(job_id);
        }
    }

    /// この実行のトークンだけを外す（再投入された新しい実行のものは残す）
    fn release_token(&self, job_id: &str, run_id: u64) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(job_id).is_some_and(|run| run.run_id == run_id) {
            active.remove(job_id);
        }
    }

    async fn run(&self, job: ClassificationJob) {
        let job_id = job.job_id.clone();
        let run_id = job.run_id;
        self.execute(job).await;
        self.release_token(&job_id, run_id);
    }

    async fn execute(&self, job: ClassificationJob) {
        let job_id = job.job_id.as_str();
        let total = job.photos.len();
        info!(job_id, total, "ジョブ開始");

        self.status.update(job_id, |s| {
            s.state = JobState::Processing;
            s.step = ProcessingStatus::STEP_PREPARING;
            s.message = format!("{}枚の写真を準備中", total);
        });

        let outcome = self
            .worker
            .run_photos(job_id, &job.photos, &job.cancel, &self.status)
            .await;

        let (photos, aggregate) = match outcome {
            LoopOutcome::Finished { photos, aggregate } => (photos, aggregate),
            LoopOutcome::Cancelled { processed } => {
                self.status.fail(
                    job_id,
                    ErrorKind::Cancelled,
                    &format!("キャンセルされました（{}/{}枚処理済み）", processed, total),
                );
                return;
            }
        };

        self.status.set_step(job_id, ProcessingStatus::STEP_AGGREGATING, 95, "結果を集計中");
        let result = ConsolidatedResult {
            job_id: job_id.to_string(),
            categories: aggregate.finish(),
            total_detected: aggregate.total(),
            manual: job.manual,
            model_id: self.model_id.clone(),
            processing_seconds: job.started.elapsed().as_secs_f64(),
            photos_ok: aggregate.photos_ok(),
            photos_failed: aggregate.photos_failed(),
            photos,
            processed_at: chrono::Local::now().to_rfc3339(),
        };

        if job.cancel.is_cancelled() {
            self.status.fail(job_id, ErrorKind::Cancelled, "キャンセルされました");
            return;
        }

        self.status.set_step(job_id, ProcessingStatus::STEP_SAVING, 95, "結果を保存中");
        if let Err(e) = self.persist(result.clone()).await {
            error!(job_id, error = %e, "結果の保存に失敗");
            self.status.fail(job_id, ErrorKind::Persistence, &e.to_string());
            return;
        }

        if result.photos_ok == 0 {
            warn!(job_id, "すべての写真の解析に失敗");
            self.status.fail(
                job_id,
                ErrorKind::AllPhotosFailed,
                &format!("すべての写真（{}枚）の解析に失敗しました", total),
            );
            return;
        }

        self.status.complete(
            job_id,
            result.total_detected,
            &format!(
                "完了: {}房を検出（成功 {}枚 / 失敗 {}枚）",
                result.total_detected, result.photos_ok, result.photos_failed
            ),
        );
        info!(job_id, total_detected = result.total_detected, "ジョブ完了");
    }

    /// 保存済みレコードとマージして保存（ジョブ単位で直列化）
    async fn persist(&self, fresh: ConsolidatedResult) -> Result<()> {
        let job_id = fresh.job_id.clone();
        let lock = self.job_lock(&job_id);

        let saved = {
            let _guard = lock.lock().await;
            let store = self.store.clone();
            let job_id = job_id.clone();
            tokio::task::spawn_blocking(move || {
                let prior = store.load(&job_id)?;
                let merged = merge_results(prior, fresh);
                store.save(&job_id, &merged)
            })
            .await
            .map_err(|e| BunchAiError::Persistence(e.to_string()))
            .and_then(|saved| saved)
        };

        self.release_job_lock(&job_id, lock);
        saved
    }
}
