use bunch_ai_common::{
    empty_counts, normalize, summarize, Category, ConsolidatedResult, ErrorKind, Geometry, ImageSize, JobState,
    ManualClassification, ProcessingStatus,
};
use bunch_ai_rust::analyzer::HttpDetectionClient;
use bunch_ai_rust::{cli, config, error, scanner};
use bunch_ai_rust::{CoordinatorSettings, JobCoordinator, JsonResultStore, ResultStore, StatusStore};
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use error::{BunchAiError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::load()?;

    match cli.command {
        Commands::Classify { job_id, photos, folder, manual } => {
            println!("🍇 bunch-ai - 果房分類\n");

            let mut photos = photos;
            if let Some(folder) = folder {
                let found = scanner::scan_folder(&folder)?;
                println!("✔ フォルダから{}枚の写真を検出", found.len());
                photos.extend(found.into_iter().map(|p| p.path));
            }
            if photos.is_empty() {
                return Err(BunchAiError::NoPhotos);
            }

            let client = HttpDetectionClient::from_config(&config)?;
            let aliases = config.load_aliases()?;
            let store = JsonResultStore::new(config.result_dir.clone());

            let coordinator = JobCoordinator::new(
                CoordinatorSettings::from_config(&config),
                Arc::new(client),
                Arc::new(store.clone()),
                Arc::new(aliases),
                StatusStore::new(),
            );

            let manual = if manual.is_empty() {
                None
            } else {
                Some(manual.into_iter().collect::<ManualClassification>())
            };

            let handle = coordinator.submit(&job_id, photos, manual)?;

            let cancel_handle = handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\n中断しています（処理中の写真が終わるまで待機）...");
                    cancel_handle.cancel();
                }
            });

            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let status = loop {
                let Some(status) = handle.status() else {
                    break None;
                };
                bar.set_position(status.progress as u64);
                bar.set_message(status.message.clone());
                if status.is_terminal() {
                    break Some(status);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            };
            bar.finish_and_clear();
            coordinator.acknowledge(&job_id);
            coordinator.shutdown().await;

            let Some(status) = status else {
                return Err(BunchAiError::JobNotFound(job_id));
            };

            if let Some(result) = store.load(&job_id)? {
                print_result(&result);
            }

            if status.state == JobState::Completed {
                println!("\n✅ {}", status.message);
            } else {
                return Err(terminal_error(&status));
            }
        }

        Commands::Show { job_id } => {
            let store = JsonResultStore::new(config.result_dir.clone());
            let result = store
                .load(&job_id)?
                .ok_or_else(|| BunchAiError::JobNotFound(job_id.clone()))?;
            print_result(&result);
        }

        Commands::Delete { job_id } => {
            let store = JsonResultStore::new(config.result_dir.clone());
            if store.delete(&job_id)? {
                println!("✔ 結果を削除しました: {}", job_id);
            } else {
                return Err(BunchAiError::JobNotFound(job_id));
            }
        }

        Commands::Normalize { response, width, height } => {
            if !response.exists() {
                return Err(BunchAiError::FileNotFound(response.display().to_string()));
            }
            let content = std::fs::read_to_string(&response)?;
            let raw: serde_json::Value = serde_json::from_str(&content)?;
            let aliases = config.load_aliases()?;

            let detections = normalize(&raw, &Geometry::new(ImageSize::new(width, height)), &aliases);
            println!("{}", serde_json::to_string_pretty(&detections)?);

            let mut counts = empty_counts();
            for detection in &detections {
                *counts.entry(detection.category).or_insert(0) += 1;
            }
            println!();
            print_categories(&summarize(&counts));
        }

        Commands::Config { set_api_key, set_service_url, show } => {
            let mut config = config;

            if let Some(key) = set_api_key {
                config.set_api_key(key)?;
                println!("✔ APIキーを設定しました");
            }

            if let Some(url) = set_service_url {
                config.set_service_url(url)?;
                println!("✔ 検出サービスのURLを設定しました");
            }

            if show {
                println!("設定:");
                println!("  サービスURL: {}", config.service_url.as_deref().unwrap_or("未設定"));
                println!("  APIキー: {}", if config.api_key.is_some() { "設定済み" } else { "未設定" });
                println!("  モデル: {}", config.model_id);
                println!("  タイムアウト: {}秒", config.timeout_seconds);
                println!("  最大画像サイズ: {}x{}px", config.max_image_width, config.max_image_height);
                println!("  1ジョブの最大写真数: {}", config.max_photos_per_job);
                println!("  ワーカー数: {}", config.worker_count);
                println!("  結果フォルダ: {}", config.result_dir.display());
                println!("  画像保存フォルダ: {}", config.artifact_dir.display());
            }
        }
    }

    Ok(())
}

fn terminal_error(status: &ProcessingStatus) -> BunchAiError {
    match status.error_kind {
        Some(ErrorKind::Persistence) => BunchAiError::Persistence(status.message.clone()),
        Some(kind) => BunchAiError::ApiCall(format!("{}: {}", kind, status.message)),
        None => BunchAiError::ApiCall(status.message.clone()),
    }
}

fn print_categories(categories: &bunch_ai_common::CategorySummary) {
    println!("  {:<18} {:>6} {:>8}", "カテゴリ", "件数", "割合");
    for category in Category::ALL {
        let stat = categories.get(&category).copied().unwrap_or_default();
        println!("  {:<18} {:>6} {:>7.1}%", category.key(), stat.count, stat.percentage);
    }
}

fn print_result(result: &ConsolidatedResult) {
    println!("ジョブ: {}", result.job_id);
    println!("処理日時: {}  モデル: {}", result.processed_at, result.model_id);
    println!();
    print_categories(&result.categories);
    println!("  合計: {}房（{:.1}秒）", result.total_detected, result.processing_seconds);

    if !result.manual.is_empty() {
        println!("\n手動分類:");
        for (key, count) in result.manual.iter() {
            println!("  {:<18} {:>6}", key, count);
        }
    }

    println!("\n写真: 成功 {}枚 / 失敗 {}枚", result.photos_ok, result.photos_failed);
    for photo in &result.photos {
        match &photo.error {
            Some(error) => println!("  [{}] {} ✖ {} ({})", photo.index, photo.file_name, error.message, error.kind),
            None => println!("  [{}] {} ✔ {}房", photo.index, photo.file_name, photo.total()),
        }
        for artifact in &photo.artifacts {
            println!("      画像: {}", artifact.path);
        }
    }
}
