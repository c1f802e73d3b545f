//! Bunch AI
//!
//! 果房写真を外部の検出サービスで分類し、カテゴリ別の件数と割合を
//! ジョブ単位で保存する非同期パイプライン。

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod scanner;
pub mod status;
pub mod store;

pub use coordinator::{CoordinatorSettings, JobCoordinator, JobHandle};
pub use error::{BunchAiError, Result};
pub use status::StatusStore;
pub use store::{JsonResultStore, ResultStore};
