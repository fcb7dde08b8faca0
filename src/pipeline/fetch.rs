//! Hosted-document download.
//!
//! Bodies are streamed into a named temp file inside a caller-provided
//! scratch directory, so a large scan never sits fully in memory while it is
//! still arriving. The temp file is deleted when the `FetchedDocument` drops,
//! on success and failure paths alike. No retries at this layer.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::discovery::DocumentReference;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Document store returned HTTP {status}")]
    Http { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Document exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Scratch storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// A downloaded document held in a scratch temp file.
#[derive(Debug)]
pub struct FetchedDocument {
    file: NamedTempFile,
    content_type: Option<String>,
    size: u64,
}

impl FetchedDocument {
    /// Write `bytes` to a new temp file in `scratch`. Used by fetchers that
    /// already hold the whole body.
    pub fn from_bytes_in(
        scratch: &Path,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Self, FetchError> {
        let mut file = NamedTempFile::new_in(scratch)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self {
            file,
            content_type: content_type.map(str::to_string),
            size: bytes.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// `Content-Type` as reported by the store, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, FetchError> {
        Ok(tokio::fs::read(self.file.path()).await?)
    }
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Download `reference` into a temp file under `scratch`.
    async fn fetch(
        &self,
        reference: &DocumentReference,
        scratch: &Path,
    ) -> Result<FetchedDocument, FetchError>;
}

/// Plain HTTP GET against the hosted document store.
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
}

impl HttpDocumentFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch(
        &self,
        reference: &DocumentReference,
        scratch: &Path,
    ) -> Result<FetchedDocument, FetchError> {
        let response = self
            .client
            .get(&reference.url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let file = NamedTempFile::new_in(scratch)?;
        let mut out = tokio::fs::File::from_std(file.reopen()?);
        let mut size = 0u64;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.classify(e))?;
            size += chunk.len() as u64;
            if size > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        tracing::debug!(url = %reference.url, bytes = size, "Document downloaded");

        Ok(FetchedDocument {
            file,
            content_type,
            size,
        })
    }
}
