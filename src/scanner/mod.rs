use crate::error::{BunchAiError, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct PhotoFile {
    pub path: PathBuf,
    pub file_name: String,
}

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

fn is_photo_extension(ext: &str) -> bool {
    PHOTO_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// フォルダ直下の写真をファイル名順に列挙
pub fn scan_folder(folder: &Path) -> Result<Vec<PhotoFile>> {
    if !folder.is_dir() {
        return Err(BunchAiError::FolderNotFound(folder.display().to_string()));
    }

    let mut photos: Vec<PhotoFile> = WalkDir::new(folder)
        .max_depth(1) // 直下のみ（再帰しない）
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| is_photo_extension(&ext.to_string_lossy()))
        })
        .map(|entry| PhotoFile {
            file_name: entry.file_name().to_string_lossy().to_string(),
            path: entry.into_path(),
        })
        .collect();

    photos.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    tracing::debug!(folder = %folder.display(), count = photos.len(), "写真を検出");
    Ok(photos)
}
