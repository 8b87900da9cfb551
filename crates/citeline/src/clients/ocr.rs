//! OCR/layout service shim.
//!
//! The service accepts a PDF and returns pages of lines with their polygons
//! (inches) and the page dimensions. The parser converts polygons to
//! percent-of-page bounding boxes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, ParseFailure, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    pub content: String,
    /// Flattened polygon `[x0, y0, x1, y1, ...]`, 4 points for a line.
    #[serde(default)]
    pub polygon: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub lines: Vec<OcrLine>,
}

#[async_trait]
pub trait OcrApi: Send + Sync {
    async fn analyze_pdf(&self, bytes: &[u8]) -> Result<Vec<OcrPage>>;
}

/// Thin HTTP client for the layout service.
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    pages: Vec<OcrPage>,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| EngineError::Internal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl OcrApi for HttpOcrClient {
    async fn analyze_pdf(&self, bytes: &[u8]) -> Result<Vec<OcrPage>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                EngineError::Parse(ParseFailure::Failed(format!("layout service call failed: {e}")))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            EngineError::Parse(ParseFailure::Failed(format!(
                "failed to read layout response: {e}"
            )))
        })?;

        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(EngineError::Parse(ParseFailure::Failed(format!(
                "layout service rejected document (HTTP {status}): {preview}"
            ))));
        }

        let parsed: AnalyzeResponse = serde_json::from_str(&body).map_err(|e| {
            EngineError::Parse(ParseFailure::Failed(format!(
                "malformed layout response: {e}"
            )))
        })?;
        Ok(parsed.pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_deserializes_with_defaults() {
        let page: OcrPage = serde_json::from_str(r#"{"width": 8.5, "height": 11.0}"#).unwrap();
        assert!(page.lines.is_empty());
        assert_eq!(page.width, 8.5);
    }

    #[test]
    fn test_line_polygon_optional() {
        let line: OcrLine = serde_json::from_str(r#"{"content": "Revenue"}"#).unwrap();
        assert!(line.polygon.is_empty());
    }
}
