//! 再分類時の結果マージ

use crate::types::ConsolidatedResult;

/// 保存済みレコードに新しい自動分類結果を重ねる
///
/// 自動分類と写真ごとの結果は新しいもので置き換える。
/// 手動分類は新しい入力が空の場合のみ保存済みのものを引き継ぐ。
pub fn merge_results(prior: Option<ConsolidatedResult>, mut fresh: ConsolidatedResult) -> ConsolidatedResult {
    if let Some(prior) = prior {
        if fresh.manual.is_empty() && !prior.manual.is_empty() {
            tracing::debug!(job_id = %fresh.job_id, "保存済みの手動分類を引き継ぎ");
            fresh.manual = prior.manual;
        }
    }
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, CategoryStat, ManualClassification, PhotoResult};

    fn record(job_id: &str, verde: u32, manual: &[(&str, f64)]) -> ConsolidatedResult {
        let mut result = ConsolidatedResult {
            job_id: job_id.to_string(),
            total_detected: verde,
            manual: manual.iter().map(|(k, v)| (*k, *v)).collect(),
            photos: vec![PhotoResult::new(1, "foto_1.jpg")],
            ..Default::default()
        };
        result.categories.insert(Category::Verde, CategoryStat { count: verde, percentage: 100.0 });
        result
    }

    #[test]
    fn test_manual_carried_forward_when_absent() {
        let prior = record("G-001", 7, &[("verdes", 5.0), ("maduros", 3.0)]);
        let fresh = record("G-001", 2, &[]);

        let merged = merge_results(Some(prior), fresh);

        let expected: ManualClassification = vec![("verdes", 5.0), ("maduros", 3.0)].into_iter().collect();
        assert_eq!(merged.manual, expected);
        assert_eq!(merged.stat(Category::Verde).count, 2);
        assert_eq!(merged.total_detected, 2);
    }

    #[test]
    fn test_new_manual_replaces_prior() {
        let prior = record("G-001", 7, &[("verdes", 5.0)]);
        let fresh = record("G-001", 2, &[("maduro", 1.0)]);

        let merged = merge_results(Some(prior), fresh);
        assert_eq!(merged.manual.get(Category::Maduro), Some(1.0));
        assert_eq!(merged.manual.get(Category::Verde), None);
    }

    #[test]
    fn test_no_prior_record() {
        let fresh = record("G-002", 3, &[]);
        let merged = merge_results(None, fresh);
        assert!(merged.manual.is_empty());
        assert_eq!(merged.photos.len(), 1);
    }
}
