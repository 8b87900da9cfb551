//! Document-to-PDF converter shim.
//!
//! Office uploads get a derived PDF for display. The converter accepts the
//! original file bytes and returns a PDF stream.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{EngineError, ParseFailure, Result};

#[async_trait]
pub trait PdfConvertApi: Send + Sync {
    async fn convert(&self, file_name: &str, bytes: Vec<u8>) -> Result<Vec<u8>>;
}

/// HTTP client for a multipart convert endpoint.
pub struct HttpPdfConverter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPdfConverter {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::Internal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PdfConvertApi for HttpPdfConverter {
    async fn convert(&self, file_name: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("files", part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                EngineError::Parse(ParseFailure::Failed(format!("pdf conversion call failed: {e}")))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(EngineError::Parse(ParseFailure::Failed(format!(
                "pdf conversion failed (HTTP {status}): {preview}"
            ))));
        }

        let pdf = response.bytes().await.map_err(|e| {
            EngineError::Parse(ParseFailure::Failed(format!(
                "failed to read converted pdf: {e}"
            )))
        })?;
        Ok(pdf.to_vec())
    }
}
