//! カテゴリ別集計
//!
//! ジョブ内の写真ごとの件数を累積し、最後に割合を計算する。

use crate::types::{empty_counts, Category, CategoryCounts, CategoryStat, CategorySummary, PhotoResult};

/// 写真をまたいだ累積集計
#[derive(Debug, Clone)]
pub struct Aggregator {
    counts: CategoryCounts,
    photos_ok: usize,
    photos_failed: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            counts: empty_counts(),
            photos_ok: 0,
            photos_failed: 0,
        }
    }

    /// 写真1枚分の結果を加算（失敗した写真は件数に含めない）
    pub fn add_photo(&mut self, photo: &PhotoResult) {
        if !photo.is_ok() {
            self.photos_failed += 1;
            return;
        }
        self.photos_ok += 1;
        for (category, count) in &photo.counts {
            *self.counts.entry(*category).or_insert(0) += count;
        }
    }

    pub fn count(&self, category: Category) -> u32 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn photos_ok(&self) -> usize {
        self.photos_ok
    }

    pub fn photos_failed(&self) -> usize {
        self.photos_failed
    }

    /// 全カテゴリの件数と割合を返す
    pub fn finish(&self) -> CategorySummary {
        summarize(&self.counts)
    }
}

/// 件数から割合を計算（小数第1位で四捨五入、合計0なら全て0）
pub fn summarize(counts: &CategoryCounts) -> CategorySummary {
    let total: u32 = counts.values().sum();
    Category::ALL
        .iter()
        .map(|&category| {
            let count = counts.get(&category).copied().unwrap_or(0);
            let percentage = if total > 0 {
                (count as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            };
            (category, CategoryStat { count, percentage })
        })
        .collect()
}
