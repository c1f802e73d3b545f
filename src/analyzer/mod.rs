//! 写真解析
//!
//! 検出サービス呼び出し、画像の前処理、埋め込み画像の保存、写真ループ。

pub mod artifact;
pub mod client;
pub mod preprocess;
pub mod worker;

pub use client::{DetectionServiceClient, HttpDetectionClient, ServiceError};
pub use worker::{LoopOutcome, PhotoWorker, WorkerSettings};
