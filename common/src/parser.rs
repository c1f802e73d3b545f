//! 検出サービスのレスポンス正規化
//!
//! サービスが返すレスポンス形状は一定しないため、純粋関数の形状マッチャーを
//! 順に試し、最初に空でない検出リストを得たものを採用する。
//!
//! 試行順:
//! 1. `{"predictions": [...]}`（`{"predictions": {"predictions": [...]}}` も可）
//! 2. `{"outputs": [{"predictions": [...]}, ...]}`（全要素を連結）
//! 3. `{"output": {"predictions": [...]}}`
//! 4. 検出オブジェクトの配列そのもの
//! 5. カテゴリ名 → 件数 のマップ（ルート, `outputs[0]`, `output` の順）

use crate::alias::CategoryAliases;
use crate::types::{BoundingBox, Detection, ImageSize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// 件数マップから合成するプレースホルダの上限（カテゴリごと）
const MAX_PLACEHOLDERS_PER_CATEGORY: u64 = 10_000;

/// 埋め込み画像として扱うキー（`label_visualization_*` は前方一致）
const ARTIFACT_KEYS: &[&str] = &["annotated_image", "output_image", "visualization"];
const ARTIFACT_PREFIX: &str = "label_visualization";

/// 座標変換に使う画像サイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// 元画像のサイズ
    pub original: ImageSize,
    /// サービスへ送信した画像のサイズ（縮小時は original より小さい）
    pub sent: ImageSize,
}

impl Geometry {
    pub fn new(original: ImageSize) -> Self {
        Self { original, sent: original }
    }

    pub fn resized(original: ImageSize, sent: ImageSize) -> Self {
        Self { original, sent }
    }

    /// 送信画像座標 → 元画像座標の倍率 (x, y)
    fn scale_back(&self) -> (f64, f64) {
        let sx = if self.sent.width > 0 {
            self.original.width as f64 / self.sent.width as f64
        } else {
            1.0
        };
        let sy = if self.sent.height > 0 {
            self.original.height as f64 / self.sent.height as f64
        } else {
            1.0
        };
        (sx, sy)
    }
}

type ShapeMatcher = fn(&Value) -> Option<Vec<&Value>>;

/// 形状マッチャー（試行順）
const SHAPES: [(&str, ShapeMatcher); 4] = [
    ("predictions", match_predictions),
    ("outputs", match_outputs),
    ("output", match_output),
    ("list", match_bare_list),
];

/// 生レスポンスを正規化済みの検出リストに変換
///
/// どの形状にも一致しない場合は空リストを返す。
pub fn normalize(raw: &Value, geometry: &Geometry, aliases: &CategoryAliases) -> Vec<Detection> {
    for (shape, matcher) in SHAPES {
        let Some(items) = matcher(raw) else {
            continue;
        };
        let detections: Vec<Detection> = items
            .into_iter()
            .filter_map(|item| parse_item(item, geometry, aliases))
            .collect();
        if !detections.is_empty() {
            debug!(shape, count = detections.len(), "レスポンス形状を検出");
            return detections;
        }
    }

    let candidates = [
        raw.as_object(),
        raw.get("outputs")
            .and_then(Value::as_array)
            .and_then(|outputs| outputs.first())
            .and_then(Value::as_object),
        raw.get("output").and_then(Value::as_object),
    ];
    for map in candidates.into_iter().flatten() {
        let detections = synthesize_from_counts(map, aliases);
        if !detections.is_empty() {
            debug!(count = detections.len(), "件数マップから検出を合成");
            return detections;
        }
    }

    Vec::new()
}

/// `predictions` を配列または入れ子オブジェクトから取り出す
fn predictions_of(value: &Value) -> Option<Vec<&Value>> {
    match value.get("predictions")? {
        Value::Array(items) => Some(items.iter().collect()),
        nested @ Value::Object(_) => nested
            .get("predictions")
            .and_then(Value::as_array)
            .map(|items| items.iter().collect()),
        _ => None,
    }
}

fn match_predictions(raw: &Value) -> Option<Vec<&Value>> {
    predictions_of(raw)
}

fn match_outputs(raw: &Value) -> Option<Vec<&Value>> {
    let outputs = raw.get("outputs")?.as_array()?;
    let items: Vec<&Value> = outputs.iter().filter_map(predictions_of).flatten().collect();
    Some(items)
}

fn match_output(raw: &Value) -> Option<Vec<&Value>> {
    predictions_of(raw.get("output")?)
}

fn match_bare_list(raw: &Value) -> Option<Vec<&Value>> {
    raw.as_array().map(|items| items.iter().collect())
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn first_f64(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_f64))
}

/// 検出オブジェクト1件を解釈（不正な要素は None）
fn parse_item(item: &Value, geometry: &Geometry, aliases: &CategoryAliases) -> Option<Detection> {
    let obj = item.as_object()?;
    let name = first_str(obj, &["class", "class_name", "label", "category"])?;
    let confidence = first_f64(obj, &["confidence", "score"])?;
    let x = first_f64(obj, &["x"])?;
    let y = first_f64(obj, &["y"])?;
    let width = first_f64(obj, &["width"])?;
    let height = first_f64(obj, &["height"])?;

    let Some(category) = aliases.resolve(name) else {
        warn!(class = name, "未対応のクラス名を破棄");
        return None;
    };

    Some(Detection {
        category,
        confidence: confidence.clamp(0.0, 1.0),
        bbox: to_absolute(BoundingBox { x, y, width, height }, geometry),
        synthesized: false,
    })
}

/// 座標を元画像の絶対ピクセルへ変換
///
/// x,y が [0,1] かつ width,height が 1 未満なら正規化座標とみなす。
fn to_absolute(bbox: BoundingBox, geometry: &Geometry) -> BoundingBox {
    let unit = 0.0..=1.0;
    let normalized = unit.contains(&bbox.x)
        && unit.contains(&bbox.y)
        && bbox.width < 1.0
        && bbox.height < 1.0;

    if normalized {
        let w = geometry.original.width as f64;
        let h = geometry.original.height as f64;
        BoundingBox {
            x: bbox.x * w,
            y: bbox.y * h,
            width: bbox.width * w,
            height: bbox.height * h,
        }
    } else {
        let (sx, sy) = geometry.scale_back();
        BoundingBox {
            x: bbox.x * sx,
            y: bbox.y * sy,
            width: bbox.width * sx,
            height: bbox.height * sy,
        }
    }
}

/// 件数値を取り出す（小数は切り捨て、負数・非有限値は None）
fn count_of(value: &Value) -> Option<u64> {
    if let Some(count) = value.as_u64() {
        return Some(count);
    }
    let count = value.as_f64()?;
    if count.is_finite() && count >= 0.0 {
        Some(count.trunc() as u64)
    } else {
        None
    }
}

/// 件数マップから座標なしのプレースホルダ検出を合成
fn synthesize_from_counts(map: &Map<String, Value>, aliases: &CategoryAliases) -> Vec<Detection> {
    let mut detections = Vec::new();
    for (name, value) in map {
        let Some(category) = aliases.resolve(name) else {
            continue;
        };
        let Some(count) = count_of(value) else {
            warn!(class = name.as_str(), value = %value, "件数として解釈できない値を無視");
            continue;
        };
        let count = if count > MAX_PLACEHOLDERS_PER_CATEGORY {
            warn!(class = name.as_str(), count, "件数が上限を超えたため切り詰め");
            MAX_PLACEHOLDERS_PER_CATEGORY
        } else {
            count
        };
        for _ in 0..count {
            detections.push(Detection {
                category,
                confidence: 1.0,
                bbox: BoundingBox::default(),
                synthesized: true,
            });
        }
    }
    detections
}

/// レスポンスに埋め込まれた画像
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedArtifact {
    pub name: String,
    /// base64文字列（data URI接頭辞を含む場合あり）
    pub payload: String,
}

fn is_artifact_key(key: &str) -> bool {
    ARTIFACT_KEYS.contains(&key) || key.starts_with(ARTIFACT_PREFIX)
}

/// 文字列、または `{"type": "base64", "value": "..."}` からペイロードを取り出す
fn artifact_payload(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => {
            let is_base64 = obj
                .get("type")
                .and_then(Value::as_str)
                .map_or(true, |t| t == "base64");
            if is_base64 {
                obj.get("value").and_then(Value::as_str)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// ルート, `outputs[*]`, `output` から埋め込み画像を列挙
///
/// 同名の画像が複数ある場合は `_<出力番号>` を付けて区別する。
pub fn extract_artifacts(raw: &Value) -> Vec<EmbeddedArtifact> {
    let mut sources: Vec<(Option<usize>, &Map<String, Value>)> = Vec::new();
    if let Some(root) = raw.as_object() {
        sources.push((None, root));
    }
    if let Some(outputs) = raw.get("outputs").and_then(Value::as_array) {
        sources.extend(
            outputs
                .iter()
                .enumerate()
                .filter_map(|(i, o)| o.as_object().map(|m| (Some(i), m))),
        );
    }
    if let Some(output) = raw.get("output").and_then(Value::as_object) {
        sources.push((None, output));
    }

    let mut artifacts: Vec<EmbeddedArtifact> = Vec::new();
    for (position, map) in sources {
        for (key, value) in map {
            if !is_artifact_key(key) {
                continue;
            }
            let Some(payload) = artifact_payload(value) else {
                continue;
            };
            let taken = artifacts.iter().any(|a| a.name == *key);
            let name = match (taken, position) {
                (true, Some(i)) => format!("{}_{}", key, i),
                (true, None) => format!("{}_{}", key, artifacts.len()),
                (false, _) => key.clone(),
            };
            artifacts.push(EmbeddedArtifact {
                name,
                payload: payload.to_string(),
            });
        }
    }
    artifacts
}

/// 監査用コピーを作成（埋め込み画像を短いプレースホルダに置換）
pub fn redact_artifacts(raw: &Value) -> Value {
    match raw {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(key, value)| {
                    let value = match artifact_payload(value) {
                        Some(payload) if is_artifact_key(key) => {
                            Value::String(format!("<base64 image omitted: {} chars>", payload.len()))
                        }
                        _ => redact_artifacts(value),
                    };
                    (key.clone(), value)
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_artifacts).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;
    use serde_json::json;

    fn square(size: u32) -> Geometry {
        Geometry::new(ImageSize::new(size, size))
    }

    fn aliases() -> CategoryAliases {
        CategoryAliases::builtin()
    }

    // =============================================
    // 形状マッチャー テスト
    // =============================================

    #[test]
    fn test_normalized_predictions_scaled_to_pixels() {
        let raw = json!({"predictions": [
            {"class": "verde", "confidence": 0.9, "x": 0.5, "y": 0.5, "width": 0.1, "height": 0.1}
        ]});

        let detections = normalize(&raw, &square(1000), &aliases());
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.category, Category::Verde);
        assert!((d.bbox.x - 500.0).abs() < 1e-9);
        assert!((d.bbox.y - 500.0).abs() < 1e-9);
        assert!((d.bbox.width - 100.0).abs() < 1e-9);
        assert!((d.bbox.height - 100.0).abs() < 1e-9);
        assert!(!d.synthesized);
    }

    #[test]
    fn test_nested_predictions_object() {
        let raw = json!({"predictions": {"image": {"width": 640}, "predictions": [
            {"class_name": "Maduro", "score": 0.7, "x": 120.0, "y": 80.0, "width": 40.0, "height": 60.0}
        ]}});

        let detections = normalize(&raw, &square(640), &aliases());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category, Category::Maduro);
        assert_eq!(detections[0].bbox.x, 120.0);
    }

    #[test]
    fn test_outputs_are_concatenated() {
        let raw = json!({"outputs": [
            {"predictions": [{"class": "podrido", "confidence": 0.8, "x": 10, "y": 10, "width": 5, "height": 5}]},
            {"predictions": {"predictions": [
                {"label": "racimo daño en corona", "confidence": 0.6, "x": 20, "y": 20, "width": 5, "height": 5}
            ]}}
        ]});

        let detections = normalize(&raw, &square(100), &aliases());
        let categories: Vec<Category> = detections.iter().map(|d| d.category).collect();
        assert_eq!(categories, vec![Category::Podrido, Category::DanioCorona]);
    }

    #[test]
    fn test_output_object() {
        let raw = json!({"output": {"predictions": [
            {"category": "sobremaduro", "confidence": 0.5, "x": 30, "y": 40, "width": 10, "height": 10}
        ]}});

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category, Category::Sobremaduro);
    }

    #[test]
    fn test_bare_list() {
        let raw = json!([
            {"class": "verde", "confidence": 0.9, "x": 10, "y": 10, "width": 4, "height": 4},
            {"class": "maduro", "confidence": 0.8, "x": 20, "y": 20, "width": 4, "height": 4}
        ]);

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn test_count_map_on_root() {
        let raw = json!({"Racimos verdes": 4});

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections.len(), 4);
        assert!(detections.iter().all(|d| d.category == Category::Verde));
        assert!(detections.iter().all(|d| d.synthesized && d.confidence == 1.0));
        assert!(detections.iter().all(|d| d.bbox == BoundingBox::default()));
    }

    #[test]
    fn test_count_map_in_first_output() {
        let raw = json!({"outputs": [{"racimos_verdes": 1, "fruta_podrida": 2, "time": 0.4}]});

        let detections = normalize(&raw, &square(100), &aliases());
        let verdes = detections.iter().filter(|d| d.category == Category::Verde).count();
        let podridos = detections.iter().filter(|d| d.category == Category::Podrido).count();
        assert_eq!((verdes, podridos), (1, 2));
    }

    #[test]
    fn test_count_map_accepts_float_counts() {
        let raw = json!({"Racimos verdes": 3.0, "fruta podrida": 2.7});

        let detections = normalize(&raw, &square(100), &aliases());
        let verdes = detections.iter().filter(|d| d.category == Category::Verde).count();
        let podridos = detections.iter().filter(|d| d.category == Category::Podrido).count();
        assert_eq!((verdes, podridos), (3, 2));
    }

    #[test]
    fn test_count_map_ignores_non_numeric_values() {
        let raw = json!({"Racimos verdes": "tres", "maduros": 2, "podrido": -1});

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|d| d.category == Category::Maduro));
    }

    #[test]
    fn test_unrecognized_shape_yields_empty() {
        assert!(normalize(&json!({"foo": "bar"}), &square(100), &aliases()).is_empty());
        assert!(normalize(&json!("text"), &square(100), &aliases()).is_empty());
        assert!(normalize(&json!({"predictions": []}), &square(100), &aliases()).is_empty());
    }

    // =============================================
    // 要素の検証 テスト
    // =============================================

    #[test]
    fn test_malformed_and_unmapped_items_skipped() {
        let raw = json!({"predictions": [
            {"class": "verde", "confidence": 0.9, "x": 1, "y": 1},
            {"class": "hoja", "confidence": 0.9, "x": 1, "y": 1, "width": 2, "height": 2},
            {"confidence": 0.9, "x": 1, "y": 1, "width": 2, "height": 2},
            "not an object",
            {"class": "maduro", "confidence": "high", "x": 1, "y": 1, "width": 2, "height": 2},
            {"class": "maduro", "confidence": 0.4, "x": 1, "y": 1, "width": 2, "height": 2}
        ]});

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category, Category::Maduro);
    }

    #[test]
    fn test_confidence_clamped() {
        let raw = json!([{"class": "verde", "confidence": 1.7, "x": 5, "y": 5, "width": 2, "height": 2}]);

        let detections = normalize(&raw, &square(100), &aliases());
        assert_eq!(detections[0].confidence, 1.0);
    }

    #[test]
    fn test_absolute_box_scaled_back_after_downscale() {
        let geometry = Geometry::resized(ImageSize::new(2304, 4096), ImageSize::new(1152, 2048));
        let raw = json!([{"class": "verde", "confidence": 0.9, "x": 100, "y": 200, "width": 50, "height": 60}]);

        let detections = normalize(&raw, &geometry, &aliases());
        let b = detections[0].bbox;
        assert_eq!((b.x, b.y, b.width, b.height), (200.0, 400.0, 100.0, 120.0));
    }

    // =============================================
    // 埋め込み画像 テスト
    // =============================================

    #[test]
    fn test_extract_artifacts() {
        let raw = json!({"outputs": [
            {
                "annotated_image": {"type": "base64", "value": "aGVsbG8="},
                "label_visualization_1": "data:image/jpeg;base64,aGk",
                "predictions": []
            },
            {"annotated_image": "d29ybGQ="}
        ]});

        let artifacts = extract_artifacts(&raw);
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["annotated_image", "label_visualization_1", "annotated_image_1"]);
        assert_eq!(artifacts[0].payload, "aGVsbG8=");
    }

    #[test]
    fn test_redact_artifacts_keeps_structure() {
        let raw = json!({"outputs": [{
            "annotated_image": {"type": "base64", "value": "aGVsbG8="},
            "predictions": [{"class": "verde"}]
        }]});

        let redacted = redact_artifacts(&raw);
        let image = &redacted["outputs"][0]["annotated_image"];
        assert_eq!(image, &json!("<base64 image omitted: 8 chars>"));
        assert_eq!(redacted["outputs"][0]["predictions"][0]["class"], "verde");
    }
}
