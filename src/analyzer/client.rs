//! 検出サービスクライアント
//!
//! 画像を送信し、生のJSONレスポンスを返す。レスポンス形状の解釈は
//! `bunch_ai_common::normalize` が担当する。

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bunch_ai_common::ErrorKind;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::error::Result;

const USER_AGENT: &str = concat!("bunch-ai-rust/", env!("CARGO_PKG_VERSION"));

/// 検出サービスのエラー分類
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("認証エラー: {0}")]
    Auth(String),

    #[error("モデルまたはエンドポイントが見つかりません: {0}")]
    NotFound(String),

    #[error("サービスに接続できません: {0}")]
    Unavailable(String),

    #[error("予期しない応答: {0}")]
    Unknown(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Auth(_) => ErrorKind::ServiceAuth,
            ServiceError::NotFound(_) => ErrorKind::ServiceNotFound,
            ServiceError::Unavailable(_) => ErrorKind::ServiceUnavailable,
            ServiceError::Unknown(_) => ErrorKind::ServiceUnknown,
        }
    }
}

/// 画像1枚を分類する外部サービス
#[async_trait]
pub trait DetectionServiceClient: Send + Sync {
    async fn classify(&self, image_path: &Path) -> std::result::Result<Value, ServiceError>;
}

/// HTTPステータスとレスポンス本文を分類する
///
/// 成功時は本文のJSONを返す。2xxでも `{"error": ...}` は失敗扱い。
pub fn interpret_response(status: u16, body: &str) -> std::result::Result<Value, ServiceError> {
    let snippet: String = body.chars().take(200).collect();
    match status {
        401 | 403 => return Err(ServiceError::Auth(format!("HTTP {}: {}", status, snippet))),
        404 => return Err(ServiceError::NotFound(format!("HTTP {}: {}", status, snippet))),
        500..=599 => return Err(ServiceError::Unavailable(format!("HTTP {}: {}", status, snippet))),
        200..=299 => {}
        _ => return Err(ServiceError::Unknown(format!("HTTP {}: {}", status, snippet))),
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| ServiceError::Unknown(format!("JSONとして解釈できません: {}", e)))?;

    if let Some(error) = value.get("error") {
        return Err(ServiceError::Unknown(format!("サービスがエラーを返しました: {}", error)));
    }

    Ok(value)
}

/// HTTP経由の検出サービスクライアント
pub struct HttpDetectionClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpDetectionClient {
    pub fn new(endpoint: String, api_key: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::BunchAiError::ApiCall(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.get_service_url()?,
            config.get_api_key()?,
            Duration::from_secs(config.timeout_seconds),
        )
    }

    fn request_body(&self, encoded: String) -> Value {
        json!({
            "api_key": self.api_key,
            "inputs": {
                "image": {"type": "base64", "value": encoded}
            }
        })
    }
}

#[async_trait]
impl DetectionServiceClient for HttpDetectionClient {
    async fn classify(&self, image_path: &Path) -> std::result::Result<Value, ServiceError> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| ServiceError::Unknown(format!("送信画像を読み込めません: {}", e)))?;
        let body = self.request_body(STANDARD.encode(&bytes));

        tracing::debug!(
            endpoint = %self.endpoint,
            bytes = bytes.len(),
            "検出サービスへ送信"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ServiceError::Unavailable(e.to_string())
                } else {
                    ServiceError::Unknown(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        interpret_response(status, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_statuses() {
        assert!(matches!(interpret_response(401, "nope"), Err(ServiceError::Auth(_))));
        assert!(matches!(interpret_response(403, ""), Err(ServiceError::Auth(_))));
    }

    #[test]
    fn test_not_found_and_server_errors() {
        assert!(matches!(interpret_response(404, ""), Err(ServiceError::NotFound(_))));
        assert!(matches!(interpret_response(500, ""), Err(ServiceError::Unavailable(_))));
        assert!(matches!(interpret_response(503, ""), Err(ServiceError::Unavailable(_))));
    }

    #[test]
    fn test_other_statuses_are_unknown() {
        let err = interpret_response(422, r#"{"message": "bad image"}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Unknown(_)));
        assert_eq!(err.kind(), ErrorKind::ServiceUnknown);
    }

    #[test]
    fn test_error_body_and_bad_json() {
        assert!(matches!(interpret_response(200, r#"{"error": "quota"}"#), Err(ServiceError::Unknown(_))));
        assert!(matches!(interpret_response(200, "<html>"), Err(ServiceError::Unknown(_))));
    }

    #[test]
    fn test_success_returns_json() {
        let value = interpret_response(200, r#"{"predictions": []}"#).unwrap();
        assert!(value["predictions"].is_array());
    }

    #[test]
    fn test_request_body_shape() {
        let client = HttpDetectionClient::new(
            "http://localhost:9001/infer".into(),
            "secret".into(),
            Duration::from_secs(5),
        )
        .unwrap();

        let body = client.request_body("QUJD".into());
        assert_eq!(body["api_key"], "secret");
        assert_eq!(body["inputs"]["image"]["type"], "base64");
        assert_eq!(body["inputs"]["image"]["value"], "QUJD");
    }
}
