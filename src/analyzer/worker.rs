//! 写真ワーカー
//!
//! ジョブ内の写真を番号順に1枚ずつ処理する。写真単位の失敗は結果に記録し、
//! 残りの写真の処理を続ける。

use bunch_ai_common::{
    extract_artifacts, normalize, redact_artifacts, Aggregator, CategoryAliases, ErrorKind,
    PhotoError, PhotoResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifact::{save_artifacts, save_local_annotated};
use super::client::DetectionServiceClient;
use super::preprocess::prepare_image;
use crate::status::StatusStore;

/// ワーカーの設定
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_image_width: u32,
    pub max_image_height: u32,
    pub artifact_dir: PathBuf,
}

/// 写真ループの結果
#[derive(Debug)]
pub enum LoopOutcome {
    Finished {
        photos: Vec<PhotoResult>,
        aggregate: Aggregator,
    },
    Cancelled {
        processed: usize,
    },
}

pub struct PhotoWorker {
    client: Arc<dyn DetectionServiceClient>,
    aliases: Arc<CategoryAliases>,
    settings: WorkerSettings,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

impl PhotoWorker {
    pub fn new(
        client: Arc<dyn DetectionServiceClient>,
        aliases: Arc<CategoryAliases>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            client,
            aliases,
            settings,
        }
    }

    /// ジョブの全写真を番号順に処理
    ///
    /// 各写真の前にキャンセルを確認し、進捗をストアへ反映する。
    pub async fn run_photos(
        &self,
        job_id: &str,
        photos: &[PathBuf],
        cancel: &CancellationToken,
        status: &StatusStore,
    ) -> LoopOutcome {
        let total = photos.len();
        let mut results = Vec::with_capacity(total);
        let mut aggregate = Aggregator::new();

        for (i, path) in photos.iter().enumerate() {
            let index = i + 1;
            if cancel.is_cancelled() {
                info!(job_id, index, "ジョブがキャンセルされました");
                return LoopOutcome::Cancelled { processed: i };
            }

            status.start_photo(job_id, index, total, &display_name(path));
            let photo = self.process_photo(job_id, index, path).await;
            aggregate.add_photo(&photo);
            results.push(photo);
            status.photo_done(job_id, index);
        }

        LoopOutcome::Finished {
            photos: results,
            aggregate,
        }
    }

    /// 写真1枚を処理（失敗は PhotoResult.error に記録）
    pub async fn process_photo(&self, job_id: &str, index: usize, path: &Path) -> PhotoResult {
        let started = Instant::now();
        let file_name = display_name(path);

        if !path.is_file() {
            warn!(job_id, index, file = %path.display(), "写真が見つかりません");
            return PhotoResult::failed(
                index,
                file_name,
                PhotoError::new(ErrorKind::PhotoMissing, format!("ファイルが見つかりません: {}", path.display())),
            );
        }

        let source = path.to_path_buf();
        let (max_w, max_h) = (self.settings.max_image_width, self.settings.max_image_height);
        let prepared = match tokio::task::spawn_blocking(move || prepare_image(&source, max_w, max_h)).await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                warn!(job_id, index, error = %e, "画像を読み込めません");
                return PhotoResult::failed(index, file_name, PhotoError::new(ErrorKind::InvalidImage, e.to_string()));
            }
            Err(e) => {
                return PhotoResult::failed(index, file_name, PhotoError::new(ErrorKind::InvalidImage, e.to_string()));
            }
        };

        let raw = match self.client.classify(prepared.upload_path()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(job_id, index, kind = %e.kind(), error = %e, "検出サービスの呼び出しに失敗");
                let mut result = PhotoResult::failed(index, file_name, PhotoError::new(e.kind(), e.to_string()));
                result.image_size = Some(prepared.original_size());
                result.resized = prepared.is_resized();
                result.processing_seconds = started.elapsed().as_secs_f64();
                return result;
            }
        };

        let mut result = PhotoResult::new(index, file_name);
        result.detections = normalize(&raw, &prepared.geometry(), &self.aliases);
        result.recount();
        result.image_size = Some(prepared.original_size());
        result.resized = prepared.is_resized();
        drop(prepared);

        let artifacts = extract_artifacts(&raw);
        let drawable = result.detections.iter().any(|d| !d.synthesized);
        if !artifacts.is_empty() || drawable {
            let dir = self.settings.artifact_dir.clone();
            let job = job_id.to_string();
            let source = path.to_path_buf();
            let detections = result.detections.clone();
            let saving = tokio::task::spawn_blocking(move || {
                let (mut saved, mut errors) = save_artifacts(&artifacts, &dir, &job, index);
                match save_local_annotated(&source, &detections, &dir, &job, index) {
                    Ok(Some(annotated)) => saved.push(annotated),
                    Ok(None) => {}
                    Err(e) => errors.push(e),
                }
                (saved, errors)
            });
            match saving.await {
                Ok((saved, errors)) => {
                    result.artifacts = saved;
                    result.artifact_errors = errors;
                }
                Err(e) => result
                    .artifact_errors
                    .push(PhotoError::new(ErrorKind::Decode, e.to_string())),
            }
        }

        result.raw_response = Some(redact_artifacts(&raw));
        result.processing_seconds = started.elapsed().as_secs_f64();

        debug!(job_id, index, detected = result.total(), "写真の解析完了");
        result
    }
}
