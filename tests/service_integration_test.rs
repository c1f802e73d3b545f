use bunch_ai_common::{normalize, CategoryAliases, Geometry, ImageSize};
use bunch_ai_rust::analyzer::{DetectionServiceClient, HttpDetectionClient, ServiceError};
use image::RgbImage;
use std::time::Duration;

#[tokio::test]
async fn detection_service_integration() {
    let url = match std::env::var("BUNCH_AI_SERVICE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("BUNCH_AI_SERVICE_URL not set; skipping integration test");
            return;
        }
    };
    let api_key = std::env::var("BUNCH_AI_API_KEY").unwrap_or_default();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("integration-test.jpg");
    RgbImage::new(320, 240).save(&path).expect("failed to write test image");

    let client = HttpDetectionClient::new(url, api_key, Duration::from_secs(60))
        .expect("failed to build client");

    match client.classify(&path).await {
        Ok(raw) => {
            // 空の画像なので検出0件もあり得る。正規化が落ちないことだけ確認する
            let detections = normalize(
                &raw,
                &Geometry::new(ImageSize::new(320, 240)),
                &CategoryAliases::builtin(),
            );
            assert!(detections.iter().all(|d| (0.0..=1.0).contains(&d.confidence)));
        }
        Err(ServiceError::Auth(message)) => panic!("service rejected credentials: {}", message),
        Err(e) => panic!("detection service failed: {}", e),
    }
}
