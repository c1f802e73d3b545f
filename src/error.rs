//! エラー型定義

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BunchAiError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("APIキーが設定されていません。`bunch-ai config --set-api-key YOUR_KEY` で設定してください")]
    MissingApiKey,

    #[error("ファイルが見つかりません: {0}")]
    FileNotFound(String),

    #[error("フォルダが見つかりません: {0}")]
    FolderNotFound(String),

    #[error("写真が指定されていません")]
    NoPhotos,

    #[error("ジョブは処理中です: {0}")]
    JobAlreadyActive(String),

    #[error("ジョブIDが不正です: {0:?}")]
    InvalidJobId(String),

    #[error("処理キューが満杯です（上限 {0} 件）")]
    QueueFull(usize),

    #[error("ジョブが見つかりません: {0}")]
    JobNotFound(String),

    #[error("保存エラー: {0}")]
    Persistence(String),

    #[error("画像読み込みエラー: {0}")]
    ImageLoad(String),

    #[error("API呼び出しエラー: {0}")]
    ApiCall(String),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] bunch_ai_common::Error),
}

pub type Result<T> = std::result::Result<T, BunchAiError>;
