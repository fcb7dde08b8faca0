//! Patient registration lookup.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatientDataError {
    #[error("Patient identifier is empty")]
    InvalidUserId,

    #[error("Patient service base url is invalid: {0}")]
    InvalidBaseUrl(String),

    #[error("Patient lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Patient service returned HTTP {status}")]
    Status { status: u16 },

    #[error("Patient service unreachable: {0}")]
    Network(String),

    #[error("Patient record is not valid JSON: {0}")]
    InvalidBody(String),
}

/// Opaque patient registration payload. Only the reference discoverer and
/// the Stage 1 prompt look inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientRecord(Value);

impl PatientRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.0.to_string())
    }
}

#[async_trait]
pub trait PatientDataSource: Send + Sync {
    async fn fetch_patient(&self, user_id: &str) -> Result<PatientRecord, PatientDataError>;
}

/// `GET {base}/patient-registration/{user_id}`
pub struct HttpPatientClient {
    base_url: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPatientClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PatientDataError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PatientDataError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(PatientDataError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PatientDataError::Network(e.to_string()))?;
        Ok(Self {
            base_url,
            client,
            timeout,
        })
    }

    fn record_url(&self, user_id: &str) -> Result<Url, PatientDataError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PatientDataError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("patient-registration")
            .push(user_id);
        Ok(url)
    }
}

#[async_trait]
impl PatientDataSource for HttpPatientClient {
    async fn fetch_patient(&self, user_id: &str) -> Result<PatientRecord, PatientDataError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(PatientDataError::InvalidUserId);
        }

        let url = self.record_url(user_id)?;
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PatientDataError::Timeout(self.timeout)
            } else {
                PatientDataError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PatientDataError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                PatientDataError::Timeout(self.timeout)
            } else {
                PatientDataError::Network(e.to_string())
            }
        })?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| PatientDataError::InvalidBody(e.to_string()))?;

        tracing::debug!(bytes = body.len(), "Patient record fetched");
        Ok(PatientRecord::new(value))
    }
}
