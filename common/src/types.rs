//! 分類結果の型定義
//!
//! CLIとワーカーで共有される型:
//! - Category / Detection: 正規化後の検出結果
//! - PhotoResult: 写真1枚分の解析結果
//! - ConsolidatedResult: ジョブ単位の永続化レコード
//! - ProcessingStatus: ポーリングされる進捗状態

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 房の状態カテゴリ（固定集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Verde,
    Maduro,
    Sobremaduro,
    Podrido,
    DanioCorona,
    PendunculoLargo,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Verde,
        Category::Maduro,
        Category::Sobremaduro,
        Category::Podrido,
        Category::DanioCorona,
        Category::PendunculoLargo,
    ];

    /// 正規キー（単数形）
    pub fn key(self) -> &'static str {
        match self {
            Category::Verde => "verde",
            Category::Maduro => "maduro",
            Category::Sobremaduro => "sobremaduro",
            Category::Podrido => "podrido",
            Category::DanioCorona => "danio_corona",
            Category::PendunculoLargo => "pendunculo_largo",
        }
    }

    /// 手動分類フォームで使われてきた複数形キー
    pub fn plural_key(self) -> &'static str {
        match self {
            Category::Verde => "verdes",
            Category::Maduro => "maduros",
            Category::Sobremaduro => "sobremaduros",
            Category::Podrido => "podridos",
            Category::DanioCorona => "danio_corona",
            Category::PendunculoLargo => "pendunculo_largo",
        }
    }

    /// 保存済みレコードのキーからカテゴリを引く
    ///
    /// 単数形・複数形・旧表記（`dano_corona`, `pedunculo_largo`）を受け付ける。
    /// 自然言語の表記ゆれは [`crate::alias::CategoryAliases`] が扱う。
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_lowercase();
        match key.as_str() {
            "verde" | "verdes" => Some(Category::Verde),
            "maduro" | "maduros" => Some(Category::Maduro),
            "sobremaduro" | "sobremaduros" => Some(Category::Sobremaduro),
            "podrido" | "podridos" => Some(Category::Podrido),
            "danio_corona" | "dano_corona" | "danio_en_corona" => Some(Category::DanioCorona),
            "pendunculo_largo" | "pedunculo_largo" => Some(Category::PendunculoLargo),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Category::from_key(&key)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown category key: {}", key)))
    }
}

/// 画像サイズ（ピクセル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// 中心座標 + 幅高さのバウンディングボックス（絶対ピクセル）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 正規化済みの検出1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub category: Category,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// 件数のみのレスポンスから合成したプレースホルダ
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthesized: bool,
}

/// カテゴリ別の件数と割合
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStat {
    #[serde(alias = "cantidad")]
    pub count: u32,
    #[serde(alias = "porcentaje", default)]
    pub percentage: f64,
}

pub type CategoryCounts = BTreeMap<Category, u32>;
pub type CategorySummary = BTreeMap<Category, CategoryStat>;

/// 全カテゴリを0で埋めた件数マップ
pub fn empty_counts() -> CategoryCounts {
    Category::ALL.iter().map(|&c| (c, 0)).collect()
}

/// 機械可読なエラー種別（写真単位・ジョブ単位で共通）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoPhotos,
    PhotoMissing,
    InvalidImage,
    ServiceAuth,
    ServiceNotFound,
    ServiceUnavailable,
    ServiceUnknown,
    Decode,
    Persistence,
    Cancelled,
    AllPhotosFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoPhotos => "no_photos",
            ErrorKind::PhotoMissing => "photo_missing",
            ErrorKind::InvalidImage => "invalid_image",
            ErrorKind::ServiceAuth => "service_auth",
            ErrorKind::ServiceNotFound => "service_not_found",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ServiceUnknown => "service_unknown",
            ErrorKind::Decode => "decode",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AllPhotosFailed => "all_photos_failed",
        };
        f.write_str(name)
    }
}

/// 写真またはアーティファクト単位のエラー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoError {
    pub kind: ErrorKind,
    pub message: String,
    /// デコードに失敗したアーティファクト名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl PhotoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            artifact: None,
        }
    }
}

/// 保存済みアーティファクト（注釈付き画像など）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedArtifact {
    pub name: String,
    pub path: String,
}

/// 写真1枚分の解析結果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoResult {
    /// 1始まりの写真番号
    pub index: usize,

    #[serde(default)]
    pub file_name: String,

    #[serde(default)]
    pub detections: Vec<Detection>,

    #[serde(default)]
    pub counts: CategoryCounts,

    /// 監査用の生レスポンス（埋め込み画像は省略済み）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhotoError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<SavedArtifact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_errors: Vec<PhotoError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<ImageSize>,

    #[serde(default)]
    pub resized: bool,

    #[serde(default)]
    pub processing_seconds: f64,
}

impl PhotoResult {
    pub fn new(index: usize, file_name: impl Into<String>) -> Self {
        Self {
            index,
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn failed(index: usize, file_name: impl Into<String>, error: PhotoError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(index, file_name)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// 検出結果からカテゴリ別件数を再計算する
    pub fn recount(&mut self) {
        let mut counts = empty_counts();
        for detection in &self.detections {
            *counts.entry(detection.category).or_insert(0) += 1;
        }
        self.counts = counts;
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// 人手による分類（入力されたキー表記のまま保持する）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManualClassification(BTreeMap<String, f64>);

impl ManualClassification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, count: f64) {
        self.0.insert(key.into(), count);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// カテゴリの値を単数形・複数形どちらのキーからでも読む
    pub fn get(&self, category: Category) -> Option<f64> {
        self.0
            .iter()
            .find(|(key, _)| Category::from_key(key) == Some(category))
            .map(|(_, &value)| value)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ManualClassification {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// ジョブ単位の統合結果（永続化される）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedResult {
    pub job_id: String,

    #[serde(default)]
    pub categories: CategorySummary,

    #[serde(default)]
    pub total_detected: u32,

    /// 自動分類とは独立した手動分類
    #[serde(default)]
    pub manual: ManualClassification,

    #[serde(default)]
    pub model_id: String,

    #[serde(default)]
    pub processing_seconds: f64,

    #[serde(default)]
    pub photos: Vec<PhotoResult>,

    #[serde(default)]
    pub photos_ok: usize,

    #[serde(default)]
    pub photos_failed: usize,

    #[serde(default)]
    pub processed_at: String,
}

impl ConsolidatedResult {
    pub fn stat(&self, category: Category) -> CategoryStat {
        self.categories.get(&category).copied().unwrap_or_default()
    }
}

/// ジョブの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }

    /// pending → processing → {completed | error} の単調遷移のみ許可
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, _) => true,
            (JobState::Processing, JobState::Pending) => false,
            (JobState::Processing, _) => true,
            (JobState::Completed, _) | (JobState::Error, _) => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Error => "error",
        };
        f.write_str(name)
    }
}

/// ポーリング用の進捗状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub state: JobState,
    pub progress: u8,
    pub step: u8,
    pub processed: usize,
    pub total: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_detected: Option<u32>,
    #[serde(default)]
    pub updated_at: String,
}

impl ProcessingStatus {
    pub const STEP_PREPARING: u8 = 1;
    pub const STEP_ANALYZING: u8 = 2;
    pub const STEP_AGGREGATING: u8 = 3;
    pub const STEP_SAVING: u8 = 4;
    pub const STEP_DONE: u8 = 5;

    pub fn pending(total: usize) -> Self {
        Self {
            state: JobState::Pending,
            progress: 0,
            step: Self::STEP_PREPARING,
            processed: 0,
            total,
            message: "処理待ち".into(),
            error_kind: None,
            total_detected: None,
            updated_at: String::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_keys() {
        assert_eq!(Category::DanioCorona.key(), "danio_corona");
        assert_eq!(Category::Verde.plural_key(), "verdes");
        assert_eq!(Category::from_key("Maduros"), Some(Category::Maduro));
        assert_eq!(Category::from_key("pedunculo_largo"), Some(Category::PendunculoLargo));
        assert_eq!(Category::from_key("azul"), None);
    }

    #[test]
    fn test_category_summary_serialize_keys() {
        let mut summary = CategorySummary::new();
        summary.insert(Category::DanioCorona, CategoryStat { count: 2, percentage: 50.0 });

        let json = serde_json::to_string(&summary).expect("シリアライズ失敗");
        assert_eq!(json, r#"{"danio_corona":{"count":2,"percentage":50.0}}"#);
    }

    #[test]
    fn test_category_summary_accepts_plural_and_legacy_fields() {
        let json = r#"{"verdes": {"cantidad": 3, "porcentaje": 60.0}, "maduro": {"count": 2, "percentage": 40.0}}"#;

        let summary: CategorySummary = serde_json::from_str(json).expect("デシリアライズ失敗");
        assert_eq!(summary[&Category::Verde].count, 3);
        assert_eq!(summary[&Category::Maduro].percentage, 40.0);
    }

    #[test]
    fn test_detection_synthesized_flag_skipped_when_false() {
        let detection = Detection {
            category: Category::Verde,
            confidence: 0.9,
            bbox: BoundingBox::default(),
            synthesized: false,
        };

        let json = serde_json::to_string(&detection).expect("シリアライズ失敗");
        assert!(json.contains("\"box\""));
        assert!(!json.contains("synthesized"));
    }

    #[test]
    fn test_manual_classification_reads_both_spellings() {
        let manual: ManualClassification =
            vec![("verdes", 5.0), ("maduro", 3.0)].into_iter().collect();

        assert_eq!(manual.get(Category::Verde), Some(5.0));
        assert_eq!(manual.get(Category::Maduro), Some(3.0));
        assert_eq!(manual.get(Category::Podrido), None);

        // キー表記はそのまま保持される
        let json = serde_json::to_string(&manual).expect("シリアライズ失敗");
        assert_eq!(json, r#"{"maduro":3.0,"verdes":5.0}"#);
    }

    #[test]
    fn test_photo_result_recount() {
        let mut photo = PhotoResult::new(1, "foto_1.jpg");
        photo.detections = vec![
            Detection { category: Category::Verde, confidence: 0.8, bbox: BoundingBox::default(), synthesized: false },
            Detection { category: Category::Verde, confidence: 0.7, bbox: BoundingBox::default(), synthesized: false },
            Detection { category: Category::Podrido, confidence: 0.6, bbox: BoundingBox::default(), synthesized: false },
        ];
        photo.recount();

        assert_eq!(photo.counts[&Category::Verde], 2);
        assert_eq!(photo.counts[&Category::Podrido], 1);
        assert_eq!(photo.counts[&Category::Maduro], 0);
        assert_eq!(photo.total(), 3);
    }

    #[test]
    fn test_job_state_transitions() {
        assert!(JobState::Pending.can_transition_to(JobState::Processing));
        assert!(JobState::Processing.can_transition_to(JobState::Completed));
        assert!(JobState::Processing.can_transition_to(JobState::Error));
        assert!(!JobState::Processing.can_transition_to(JobState::Pending));
        assert!(!JobState::Completed.can_transition_to(JobState::Processing));
        assert!(!JobState::Error.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_error_kind_serialize() {
        let json = serde_json::to_string(&ErrorKind::PhotoMissing).expect("シリアライズ失敗");
        assert_eq!(json, "\"photo_missing\"");
        assert_eq!(ErrorKind::ServiceAuth.to_string(), "service_auth");
    }
}
