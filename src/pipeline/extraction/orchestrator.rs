use std::borrow::Cow;

use super::preprocess::prepare_for_ocr;
use super::sanitize::sanitize_extracted_text;
use super::types::{ExtractionMethod, ExtractionOutcome, OcrEngine, PdfExtractor};
use crate::pipeline::discovery::DocumentKind;

/// Text stood in for an image when no OCR engine could read it.
pub const OCR_UNAVAILABLE_PLACEHOLDER: &str =
    "[Image OCR not available: the text of this image could not be extracted]";
/// Text stood in for an image OCR ran on but found nothing readable in.
pub const OCR_NO_TEXT_PLACEHOLDER: &str = "[Image OCR found no legible text]";

const PAGE_SEPARATOR: &str = "\n\n--- Page Break ---\n\n";

/// Turns document bytes into plain text.
/// Uses trait objects for OCR and PDF extraction, enabling dependency injection.
/// `extract` never fails: every problem becomes a status on the outcome.
pub struct DocumentExtractor {
    ocr_engine: Option<Box<dyn OcrEngine + Send + Sync>>,
    pdf_extractor: Box<dyn PdfExtractor + Send + Sync>,
}

impl DocumentExtractor {
    pub fn new(pdf_extractor: Box<dyn PdfExtractor + Send + Sync>) -> Self {
        Self {
            ocr_engine: None,
            pdf_extractor,
        }
    }

    pub fn with_ocr_engine(mut self, engine: Box<dyn OcrEngine + Send + Sync>) -> Self {
        self.ocr_engine = Some(engine);
        self
    }

    pub fn has_ocr(&self) -> bool {
        self.ocr_engine.is_some()
    }

    pub fn extract(&self, bytes: &[u8], kind: DocumentKind) -> ExtractionOutcome {
        let outcome = match kind {
            DocumentKind::Pdf => self.extract_pdf(bytes),
            DocumentKind::Image => self.extract_image(bytes),
            DocumentKind::Unknown => ExtractionOutcome::unsupported(),
        };

        tracing::debug!(
            kind = kind.as_str(),
            status = outcome.status.as_str(),
            pages = outcome.page_count,
            chars = outcome.text.len(),
            "Extraction finished"
        );
        outcome
    }

    fn extract_pdf(&self, bytes: &[u8]) -> ExtractionOutcome {
        let pages = match self.pdf_extractor.extract_pages(bytes) {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(error = %e, "PDF text extraction failed");
                return ExtractionOutcome::failed("", ExtractionMethod::PdfText, 0, e.to_string());
            }
        };

        let page_count = pages.len();
        let text = pages
            .iter()
            .map(|page| sanitize_extracted_text(page))
            .filter(|page| !page.is_empty())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR);

        if text.is_empty() {
            return ExtractionOutcome::failed(
                "",
                ExtractionMethod::PdfText,
                page_count,
                "PDF has no extractable text layer",
            );
        }

        ExtractionOutcome::ok(text, ExtractionMethod::PdfText, page_count, 0.95)
    }

    fn extract_image(&self, bytes: &[u8]) -> ExtractionOutcome {
        let Some(engine) = &self.ocr_engine else {
            return ExtractionOutcome::failed(
                OCR_UNAVAILABLE_PLACEHOLDER,
                ExtractionMethod::None,
                1,
                "no OCR engine configured",
            );
        };

        let prepared: Cow<'_, [u8]> = match prepare_for_ocr(bytes) {
            Ok(png) => Cow::Owned(png),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Image preprocessing failed, passing original bytes to OCR"
                );
                Cow::Borrowed(bytes)
            }
        };

        match engine.ocr_image(&prepared) {
            Ok(result) => {
                let text = sanitize_extracted_text(&result.text);
                if text.is_empty() {
                    ExtractionOutcome::failed(
                        OCR_NO_TEXT_PLACEHOLDER,
                        ExtractionMethod::Ocr,
                        1,
                        "OCR produced no legible text",
                    )
                } else {
                    ExtractionOutcome::ok(text, ExtractionMethod::Ocr, 1, result.confidence)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "OCR failed");
                ExtractionOutcome::failed(
                    OCR_UNAVAILABLE_PLACEHOLDER,
                    ExtractionMethod::Ocr,
                    1,
                    e.to_string(),
                )
            }
        }
    }
}

/// Production extractor: pdf-extract plus Tesseract when available.
pub fn build_extractor() -> DocumentExtractor {
    let extractor = DocumentExtractor::new(Box::new(super::pdf::PdfTextExtractor));
    match super::ocr::build_ocr_engine() {
        Some(engine) => extractor.with_ocr_engine(engine),
        None => extractor,
    }
}
