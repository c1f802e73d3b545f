//! 送信前の画像縮小
//!
//! 上限サイズを超える画像はアスペクト比を保って縮小し、一時JPEGとして書き出す。
//! 一時ファイルは `PreparedImage` の破棄時に削除される。

use bunch_ai_common::{Geometry, ImageSize};
use image::imageops::FilterType;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{BunchAiError, Result};

/// サービスへ送る準備ができた画像
#[derive(Debug)]
pub struct PreparedImage {
    source: PathBuf,
    original: ImageSize,
    sent: ImageSize,
    resized: Option<NamedTempFile>,
}

impl PreparedImage {
    /// 送信するファイルのパス
    pub fn upload_path(&self) -> &Path {
        match &self.resized {
            Some(temp) => temp.path(),
            None => &self.source,
        }
    }

    pub fn original_size(&self) -> ImageSize {
        self.original
    }

    pub fn is_resized(&self) -> bool {
        self.resized.is_some()
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::resized(self.original, self.sent)
    }
}

/// 縮小後のサイズ（上限内なら None）
pub fn fit_within(size: ImageSize, max_width: u32, max_height: u32) -> Option<ImageSize> {
    let (max_width, max_height) = (max_width.max(1), max_height.max(1));
    if size.width <= max_width && size.height <= max_height {
        return None;
    }
    let ratio = f64::min(
        max_width as f64 / size.width as f64,
        max_height as f64 / size.height as f64,
    );
    let width = ((size.width as f64 * ratio).round() as u32).clamp(1, max_width);
    let height = ((size.height as f64 * ratio).round() as u32).clamp(1, max_height);
    Some(ImageSize::new(width, height))
}

/// 画像を検証し、必要なら縮小する（ブロッキング処理）
pub fn prepare_image(path: &Path, max_width: u32, max_height: u32) -> Result<PreparedImage> {
    let (width, height) = image::image_dimensions(path)
        .map_err(|e| BunchAiError::ImageLoad(format!("{}: {}", path.display(), e)))?;
    let original = ImageSize::new(width, height);

    let Some(target) = fit_within(original, max_width, max_height) else {
        return Ok(PreparedImage {
            source: path.to_path_buf(),
            original,
            sent: original,
            resized: None,
        });
    };

    let img = image::open(path)
        .map_err(|e| BunchAiError::ImageLoad(format!("{}: {}", path.display(), e)))?;
    let resized = img
        .resize_exact(target.width, target.height, FilterType::Lanczos3)
        .to_rgb8();

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "photo".into());
    let temp = tempfile::Builder::new()
        .prefix(&format!("{}_resized_", stem))
        .suffix(".jpg")
        .tempfile()?;
    resized
        .save_with_format(temp.path(), ImageFormat::Jpeg)
        .map_err(|e| BunchAiError::ImageLoad(format!("縮小画像の保存に失敗: {}", e)))?;

    tracing::debug!(
        file = %path.display(),
        from = ?(width, height),
        to = ?(target.width, target.height),
        "画像を縮小"
    );

    Ok(PreparedImage {
        source: path.to_path_buf(),
        original,
        sent: target,
        resized: Some(temp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(ImageSize::new(800, 600), 1152, 2048), None);
        assert_eq!(
            fit_within(ImageSize::new(3000, 1000), 1152, 2048),
            Some(ImageSize::new(1152, 384))
        );
        assert_eq!(
            fit_within(ImageSize::new(2304, 4096), 1152, 2048),
            Some(ImageSize::new(1152, 2048))
        );
    }

    #[test]
    fn test_small_image_sent_as_is() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.png");
        RgbImage::new(64, 32).save(&path).unwrap();

        let prepared = prepare_image(&path, 1152, 2048).unwrap();
        assert!(!prepared.is_resized());
        assert_eq!(prepared.upload_path(), path.as_path());
        assert_eq!(prepared.original_size(), ImageSize::new(64, 32));
    }

    #[test]
    fn test_large_image_resized_to_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.png");
        RgbImage::new(400, 100).save(&path).unwrap();

        let prepared = prepare_image(&path, 200, 200).unwrap();
        assert!(prepared.is_resized());
        let upload = prepared.upload_path().to_path_buf();
        assert_eq!(image::image_dimensions(&upload).unwrap(), (200, 50));
        assert_eq!(prepared.geometry().original, ImageSize::new(400, 100));

        drop(prepared);
        assert!(!upload.exists());
    }

    #[test]
    fn test_unreadable_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        let result = prepare_image(&path, 1152, 2048);
        assert!(matches!(result, Err(BunchAiError::ImageLoad(_))));
    }
}
