use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::services::{DocumentReader, ReadConfig, Segment};

const READ_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    chunks: Vec<Segment>,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Serialize)]
struct ReadUrlRequest<'a> {
    url: &'a str,
    title: &'a str,
    config: &'a ReadConfig,
}

/// Client of the docreader HTTP service.
pub struct HttpDocumentReader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentReader {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(READ_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn decode(response: reqwest::Response) -> Result<Vec<Segment>, AppError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Processing(format!(
                "document reader returned {status}: {body}"
            )));
        }
        let parsed: ReadResponse = response.json().await?;
        if !parsed.error.is_empty() {
            return Err(AppError::Processing(parsed.error));
        }
        Ok(parsed.chunks)
    }
}

#[async_trait]
impl DocumentReader for HttpDocumentReader {
    async fn read_from_file(
        &self,
        bytes: Bytes,
        file_name: &str,
        file_type: &str,
        config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError> {
        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .to_string();
        let config_json = serde_json::to_string(config)?;
        let size = bytes.len();

        info!(%file_name, %file_type, size, %content_type, "reading file through docreader");
        let response = self
            .client
            .post(self.endpoint("read/file"))
            .query(&[
                ("file_name", file_name),
                ("file_type", file_type),
                ("config", config_json.as_str()),
            ])
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        let segments = Self::decode(response).await?;
        debug!(%file_name, segments = segments.len(), "docreader finished file");
        Ok(segments)
    }

    async fn read_from_url(
        &self,
        url: &str,
        title: &str,
        config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError> {
        info!(%url, "reading url through docreader");
        let response = self
            .client
            .post(self.endpoint("read/url"))
            .json(&ReadUrlRequest { url, title, config })
            .send()
            .await?;

        let segments = Self::decode(response).await?;
        debug!(%url, segments = segments.len(), "docreader finished url");
        Ok(segments)
    }
}
