use crate::error::{BunchAiError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_API_KEY: &str = "BUNCH_AI_API_KEY";
pub const ENV_SERVICE_URL: &str = "BUNCH_AI_SERVICE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_url: Option<String>,
    pub api_key: Option<String>,
    pub model_id: String,
    pub timeout_seconds: u64,
    pub max_image_width: u32,
    pub max_image_height: u32,
    pub max_photos_per_job: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub result_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// 追加のカテゴリ同義語表（JSON）
    pub alias_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bunch-ai");
        Self {
            service_url: None,
            api_key: None,
            model_id: "bunch-detector".into(),
            timeout_seconds: 60,
            max_image_width: 1152,
            max_image_height: 2048,
            max_photos_per_job: 3,
            worker_count: 2,
            queue_capacity: 32,
            result_dir: data_dir.join("results"),
            artifact_dir: data_dir.join("artifacts"),
            alias_file: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// 指定パスから読み込み（存在しなければデフォルト）
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| BunchAiError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join("bunch-ai").join("config.json"))
    }

    pub fn get_api_key(&self) -> Result<String> {
        // 環境変数を優先
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.is_empty() {
                return Ok(key);
            }
        }

        self.api_key.clone().ok_or(BunchAiError::MissingApiKey)
    }

    pub fn get_service_url(&self) -> Result<String> {
        if let Ok(url) = std::env::var(ENV_SERVICE_URL) {
            if !url.is_empty() {
                return Ok(url);
            }
        }

        self.service_url.clone().ok_or_else(|| {
            BunchAiError::Config(
                "検出サービスのURLが未設定です。`bunch-ai config --set-service-url URL` で設定してください".into(),
            )
        })
    }

    pub fn set_api_key(&mut self, key: String) -> Result<()> {
        self.api_key = Some(key);
        self.save()
    }

    pub fn set_service_url(&mut self, url: String) -> Result<()> {
        self.service_url = Some(url);
        self.save()
    }

    /// 組み込み表に設定ファイルの同義語を重ねたもの
    pub fn load_aliases(&self) -> Result<bunch_ai_common::CategoryAliases> {
        let mut aliases = bunch_ai_common::CategoryAliases::builtin();
        if let Some(path) = &self.alias_file {
            let custom = bunch_ai_common::CategoryAliases::from_file(path)?;
            aliases.merge(&custom);
        }
        Ok(aliases)
    }
}
