use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Per-document result status, shared by the extractor and the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Ok,
    FetchFailed,
    ExtractFailed,
    Unsupported,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FetchFailed => "fetch_failed",
            Self::ExtractFailed => "extract_failed",
            Self::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How text was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    PdfText,
    Ocr,
    None,
}

/// What the extractor hands back for one file. Always produced, even when
/// nothing could be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub text: String,
    pub status: ExtractionStatus,
    pub method: ExtractionMethod,
    pub page_count: usize,
    pub confidence: f32,
    /// Why extraction failed. Never contains document text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExtractionOutcome {
    pub fn ok(text: String, method: ExtractionMethod, page_count: usize, confidence: f32) -> Self {
        Self {
            text,
            status: ExtractionStatus::Ok,
            method,
            page_count,
            confidence,
            detail: None,
        }
    }

    pub fn failed(
        text: impl Into<String>,
        method: ExtractionMethod,
        page_count: usize,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            status: ExtractionStatus::ExtractFailed,
            method,
            page_count,
            confidence: 0.0,
            detail: Some(detail.into()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            text: String::new(),
            status: ExtractionStatus::Unsupported,
            method: ExtractionMethod::None,
            page_count: 0,
            confidence: 0.0,
            detail: Some("file type is not pdf or image".into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExtractionStatus::Ok
    }
}

/// Raw OCR result from the engine
#[derive(Debug)]
pub struct OcrPageResult {
    pub text: String,
    pub confidence: f32,
}

/// OCR engine abstraction (allows mocking in tests)
pub trait OcrEngine {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// PDF text extraction abstraction: one string per page.
pub trait PdfExtractor {
    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError>;
}
