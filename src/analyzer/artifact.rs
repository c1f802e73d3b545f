//! 埋め込み画像のデコードと保存、検出枠の描画
//!
//! サービスが返すbase64画像は data URI 接頭辞付き、パディング欠落、
//! 不正文字混入のいずれもあり得るため、整形してからデコードする。
//! 検出枠を元写真に描いた注釈画像もここで保存する。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bunch_ai_common::{
    BoundingBox, Category, Detection, EmbeddedArtifact, ErrorKind, PhotoError, SavedArtifact,
};
use image::{ImageFormat, Rgb, RgbImage};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

/// ローカルで描画した注釈画像の名前
pub const LOCAL_ANNOTATED: &str = "local_annotated";

/// 枠線の太さ（px）
const BOX_THICKNESS: u32 = 3;

lazy_static! {
    static ref DATA_URI_PREFIX: Regex = Regex::new(r"^\s*data:[^,]*,").unwrap();
}

/// base64文字列を整形（接頭辞除去・不正文字除去・パディング補完）
pub fn clean_base64(payload: &str) -> String {
    let body = DATA_URI_PREFIX.replace(payload, "");
    let mut cleaned: String = body
        .chars()
        .filter_map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' => Some(c),
            '-' => Some('+'),
            '_' => Some('/'),
            _ => None,
        })
        .collect();
    let remainder = cleaned.len() % 4;
    if remainder != 0 {
        cleaned.push_str(&"=".repeat(4 - remainder));
    }
    cleaned
}

/// base64をデコードし、画像形式と合わせて返す
pub fn decode_image(payload: &str) -> Result<(Vec<u8>, image::ImageFormat), String> {
    let cleaned = clean_base64(payload);
    if cleaned.is_empty() {
        return Err("画像データが空です".into());
    }
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| format!("base64デコード失敗: {}", e))?;
    let format = image::guess_format(&bytes).map_err(|e| format!("画像形式を判別できません: {}", e))?;
    Ok((bytes, format))
}

/// ファイル名に使えない文字を置換
pub fn sanitize_file_component(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// `<job>_<index>_<name>.<ext>`
fn artifact_path(dir: &Path, job_id: &str, index: usize, name: &str, extension: &str) -> PathBuf {
    dir.join(format!(
        "{}_{}_{}.{}",
        sanitize_file_component(job_id),
        index,
        sanitize_file_component(name),
        extension
    ))
}

/// 写真1枚分の埋め込み画像を保存（ブロッキング処理）
///
/// 失敗は画像ごとに `Decode` エラーとして返し、処理は継続する。
pub fn save_artifacts(
    artifacts: &[EmbeddedArtifact],
    dir: &Path,
    job_id: &str,
    index: usize,
) -> (Vec<SavedArtifact>, Vec<PhotoError>) {
    let mut saved = Vec::new();
    let mut errors = Vec::new();

    for artifact in artifacts {
        let result = decode_image(&artifact.payload).and_then(|(bytes, format)| {
            std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
            let extension = format.extensions_str().first().copied().unwrap_or("img");
            let path = artifact_path(dir, job_id, index, &artifact.name, extension);
            std::fs::write(&path, &bytes).map_err(|e| e.to_string())?;
            Ok(path)
        });

        match result {
            Ok(path) => saved.push(SavedArtifact {
                name: artifact.name.clone(),
                path: path.display().to_string(),
            }),
            Err(message) => {
                tracing::warn!(job_id, index, artifact = %artifact.name, %message, "埋め込み画像を保存できません");
                errors.push(PhotoError {
                    kind: ErrorKind::Decode,
                    message,
                    artifact: Some(artifact.name.clone()),
                });
            }
        }
    }

    (saved, errors)
}

fn category_color(category: Category) -> Rgb<u8> {
    match category {
        Category::Verde => Rgb([0, 128, 0]),
        Category::Maduro => Rgb([255, 165, 0]),
        Category::Sobremaduro => Rgb([255, 0, 0]),
        Category::Podrido => Rgb([75, 0, 130]),
        Category::DanioCorona => Rgb([255, 192, 203]),
        Category::PendunculoLargo => Rgb([0, 0, 255]),
    }
}

/// 中心座標の矩形を枠線で描く（画像外は切り詰め）
fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let to_x = |v: f64| v.round().clamp(0.0, (width - 1) as f64) as u32;
    let to_y = |v: f64| v.round().clamp(0.0, (height - 1) as f64) as u32;
    let (x1, x2) = (to_x(bbox.x - bbox.width / 2.0), to_x(bbox.x + bbox.width / 2.0));
    let (y1, y2) = (to_y(bbox.y - bbox.height / 2.0), to_y(bbox.y + bbox.height / 2.0));

    for t in 0..BOX_THICKNESS {
        let (top, bottom) = ((y1 + t).min(y2), y2.saturating_sub(t).max(y1));
        let (left, right) = ((x1 + t).min(x2), x2.saturating_sub(t).max(x1));
        for x in x1..=x2 {
            img.put_pixel(x, top, color);
            img.put_pixel(x, bottom, color);
        }
        for y in y1..=y2 {
            img.put_pixel(left, y, color);
            img.put_pixel(right, y, color);
        }
    }
}

fn is_drawable(detection: &Detection) -> bool {
    let b = &detection.bbox;
    !detection.synthesized
        && [b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite())
        && b.width > 0.0
        && b.height > 0.0
}

/// 元写真に検出枠を描いた画像を作る
pub fn render_annotated(source: &Path, detections: &[Detection]) -> Result<RgbImage, String> {
    let mut img = image::open(source)
        .map_err(|e| format!("{}: {}", source.display(), e))?
        .to_rgb8();
    for detection in detections.iter().filter(|d| is_drawable(d)) {
        draw_box(&mut img, &detection.bbox, category_color(detection.category));
    }
    Ok(img)
}

/// 検出枠付きの注釈画像を JPEG で保存（ブロッキング処理）
///
/// 描ける検出がなければ `Ok(None)`。失敗は `Decode` エラーとして返す。
pub fn save_local_annotated(
    source: &Path,
    detections: &[Detection],
    dir: &Path,
    job_id: &str,
    index: usize,
) -> Result<Option<SavedArtifact>, PhotoError> {
    if !detections.iter().any(is_drawable) {
        return Ok(None);
    }

    let result = render_annotated(source, detections).and_then(|img| {
        std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        let path = artifact_path(dir, job_id, index, LOCAL_ANNOTATED, "jpg");
        img.save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|e| e.to_string())?;
        Ok(path)
    });

    match result {
        Ok(path) => Ok(Some(SavedArtifact {
            name: LOCAL_ANNOTATED.to_string(),
            path: path.display().to_string(),
        })),
        Err(message) => {
            tracing::warn!(job_id, index, %message, "注釈画像を生成できません");
            Err(PhotoError {
                kind: ErrorKind::Decode,
                message,
                artifact: Some(LOCAL_ANNOTATED.to_string()),
            })
        }
    }
}
