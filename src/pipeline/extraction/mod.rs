pub mod format;
pub mod ocr;
pub mod orchestrator;
pub mod pdf;
pub mod preprocess;
pub mod sanitize;
pub mod types;

pub use format::*;
pub use ocr::*;
pub use orchestrator::*;
pub use pdf::*;
pub use preprocess::*;
pub use sanitize::*;
pub use types::*;

use std::path::PathBuf;

use thiserror::Error;

/// Failures inside a single extractor. These never leave `DocumentExtractor`:
/// they are folded into an `ExtractionOutcome` status plus a detail string.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Tesseract OCR initialization failed: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Tessdata not found at: {0}")]
    TessdataNotFound(PathBuf),
}
