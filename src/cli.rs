use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bunch-ai")]
#[command(about = "果房写真の自動分類ツール", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 写真を分類して結果を保存
    Classify {
        /// ジョブID（検査単位のID）
        job_id: String,

        /// 写真ファイル
        photos: Vec<PathBuf>,

        /// 写真フォルダ（直下のjpg/jpeg/pngを追加）
        #[arg(short, long)]
        folder: Option<PathBuf>,

        /// 手動分類（例: --manual verdes=5 --manual maduros=3）
        #[arg(short, long, value_parser = parse_manual_entry)]
        manual: Vec<(String, f64)>,
    },

    /// 保存済みの結果を表示
    Show {
        job_id: String,
    },

    /// 保存済みの結果を削除
    Delete {
        job_id: String,
    },

    /// 保存済みレスポンスJSONを正規化して表示（診断用）
    Normalize {
        /// レスポンスJSONファイル
        response: PathBuf,

        /// 元画像の幅
        #[arg(long, default_value = "1")]
        width: u32,

        /// 元画像の高さ
        #[arg(long, default_value = "1")]
        height: u32,
    },

    /// 設定を管理
    Config {
        /// APIキーを設定
        #[arg(long)]
        set_api_key: Option<String>,

        /// 検出サービスのURLを設定
        #[arg(long)]
        set_service_url: Option<String>,

        /// 現在の設定を表示
        #[arg(long)]
        show: bool,
    },
}

/// `KEY=COUNT` 形式の手動分類を解釈
pub fn parse_manual_entry(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("KEY=COUNT 形式で指定してください: {}", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("キーが空です: {}", s));
    }
    let count: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("件数が数値ではありません: {}", value))?;
    if count < 0.0 || !count.is_finite() {
        return Err(format!("件数が不正です: {}", value));
    }
    Ok((key.to_string(), count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_manual_entry() {
        assert_eq!(parse_manual_entry("verdes=5").unwrap(), ("verdes".to_string(), 5.0));
        assert_eq!(parse_manual_entry(" maduros = 2.5").unwrap(), ("maduros".to_string(), 2.5));
        assert!(parse_manual_entry("verdes").is_err());
        assert!(parse_manual_entry("=3").is_err());
        assert!(parse_manual_entry("verdes=x").is_err());
        assert!(parse_manual_entry("verdes=-1").is_err());
    }

    #[test]
    fn test_parse_classify_command() {
        let cli = Cli::try_parse_from([
            "bunch-ai", "classify", "G-001", "a.jpg", "b.jpg", "--manual", "verdes=5",
        ])
        .unwrap();

        match cli.command {
            Commands::Classify { job_id, photos, manual, folder } => {
                assert_eq!(job_id, "G-001");
                assert_eq!(photos.len(), 2);
                assert_eq!(manual, vec![("verdes".to_string(), 5.0)]);
                assert!(folder.is_none());
            }
            _ => panic!("Expected Classify"),
        }
    }
}
