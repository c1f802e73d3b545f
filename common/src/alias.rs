//! カテゴリ名の表記ゆれ変換モジュール
//!
//! 検出サービスが返すクラス名（"Racimos verdes", "fruta_podrida" など）を
//! 固定カテゴリへ対応付ける。対応表はデータファイルで管理する。

use crate::error::{Error, Result};
use crate::types::Category;
use std::collections::{BTreeMap, HashMap};

/// 組み込みの同義語表
const BUILTIN_ALIASES: &str = include_str!("../data/category_aliases.json");

/// クラス名 → カテゴリの対応表
#[derive(Debug, Clone, Default)]
pub struct CategoryAliases {
    synonyms: HashMap<String, Category>,
}

/// 比較用にクラス名を畳み込む
///
/// 小文字化し、`_` と `-` を空白に置換、連続空白を1つにまとめる。
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
        .replace(|c: char| c == '_' || c == '-', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl CategoryAliases {
    /// 組み込みの同義語表を読み込む
    pub fn builtin() -> Self {
        match Self::from_json(BUILTIN_ALIASES) {
            Ok(aliases) => aliases,
            Err(e) => {
                tracing::error!(error = %e, "組み込みエイリアスの読み込みに失敗");
                Self::canonical_only()
            }
        }
    }

    /// JSON文字列から読み込み
    ///
    /// 形式: `{ "<カテゴリキー>": ["同義語", ...], ... }`
    pub fn from_json(json: &str) -> Result<Self> {
        let table: BTreeMap<String, Vec<String>> = serde_json::from_str(json)?;
        let mut aliases = Self::canonical_only();

        for (key, names) in table {
            let category = Category::from_key(&key)
                .ok_or_else(|| Error::Parse(format!("unknown category key: {}", key)))?;
            for name in names {
                aliases.insert(&name, category);
            }
        }

        Ok(aliases)
    }

    /// JSONファイルから読み込み
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// 正規キーと複数形キーのみの対応表
    fn canonical_only() -> Self {
        let mut aliases = Self::default();
        for category in Category::ALL {
            aliases.insert(category.key(), category);
            aliases.insert(category.plural_key(), category);
        }
        aliases
    }

    pub fn insert(&mut self, name: &str, category: Category) {
        self.synonyms.insert(fold_name(name), category);
    }

    /// 設定をマージ（後から追加した設定が優先）
    pub fn merge(&mut self, other: &CategoryAliases) {
        self.synonyms
            .extend(other.synonyms.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// クラス名をカテゴリに解決する
    pub fn resolve(&self, name: &str) -> Option<Category> {
        let folded = fold_name(name);
        if folded.is_empty() {
            return None;
        }
        self.synonyms
            .get(&folded)
            .copied()
            .or_else(|| Category::from_key(&folded.replace(' ', "_")))
    }

    pub fn len(&self) -> usize {
        self.synonyms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty()
    }
}
