//! HTTP GET abstraction for prebuilt binaries and runtime archives

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Server error while downloading from {url}: HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Fetches a URL into memory
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// [`Downloader`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("oxide-remote/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Bytes, DownloadError> {
        info!("[native-deps] Download from {}", url);
        let request_error = |e: reqwest::Error| DownloadError::Request {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(request_error)
    }
}
