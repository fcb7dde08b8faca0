use std::path::{Path, PathBuf};

use super::types::{OcrEngine, OcrPageResult};
use super::ExtractionError;

/// Well-known tessdata locations, checked after `TESSDATA_PREFIX`.
const TESSDATA_CANDIDATES: &[&str] = &[
    "/usr/share/tesseract-ocr/5/tessdata",
    "/usr/share/tesseract-ocr/4.00/tessdata",
    "/usr/share/tessdata",
    "/usr/local/share/tessdata",
    "/opt/homebrew/share/tessdata",
];

/// Tesseract OCR engine backed by the system library.
/// Only available when compiled with the `ocr` feature flag.
#[cfg(feature = "ocr")]
pub struct BundledTesseract {
    tessdata_dir: PathBuf,
    lang: String,
}

#[cfg(feature = "ocr")]
impl BundledTesseract {
    pub fn new(tessdata_dir: &Path) -> Result<Self, ExtractionError> {
        if !tessdata_dir.join("eng.traineddata").exists() {
            return Err(ExtractionError::TessdataNotFound(tessdata_dir.to_path_buf()));
        }
        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            lang: "eng".to_string(),
        })
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for BundledTesseract {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let tessdata_str = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| ExtractionError::OcrInit("Invalid tessdata path".into()))?;

        let mut tess = tesseract::Tesseract::new(Some(tessdata_str), Some(&self.lang))
            .map_err(|e| ExtractionError::OcrInit(format!("{e:?}")))?
            .set_image_from_mem(image_bytes)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;
        let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;

        Ok(OcrPageResult { text, confidence })
    }
}

/// Fixed-output OCR engine for tests.
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
    pub failure: Option<String>,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            failure: None,
        }
    }

    /// Engine whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            failure: Some(message.to_string()),
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        if let Some(message) = &self.failure {
            return Err(ExtractionError::OcrProcessing(message.clone()));
        }
        Ok(OcrPageResult {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

/// Locate a tessdata directory containing `eng.traineddata`, preferring
/// `TESSDATA_PREFIX` over the well-known system paths.
pub fn find_tessdata_dir() -> Option<PathBuf> {
    let prefix = std::env::var_os("TESSDATA_PREFIX").map(PathBuf::from);
    let candidates: Vec<PathBuf> = TESSDATA_CANDIDATES.iter().map(PathBuf::from).collect();
    find_tessdata_dir_in(prefix.as_deref(), &candidates)
}

fn find_tessdata_dir_in(prefix: Option<&Path>, candidates: &[PathBuf]) -> Option<PathBuf> {
    prefix
        .into_iter()
        .chain(candidates.iter().map(PathBuf::as_path))
        .find(|dir| dir.join("eng.traineddata").exists())
        .map(Path::to_path_buf)
}

/// Build the production OCR engine, or `None` when this build or host has
/// no Tesseract. Images then degrade to a placeholder instead of failing.
pub fn build_ocr_engine() -> Option<Box<dyn OcrEngine + Send + Sync>> {
    #[cfg(feature = "ocr")]
    {
        match find_tessdata_dir() {
            Some(tessdata) => match BundledTesseract::new(&tessdata) {
                Ok(engine) => {
                    tracing::info!(tessdata = %tessdata.display(), "Tesseract OCR initialized");
                    return Some(Box::new(engine));
                }
                Err(e) => tracing::warn!(error = %e, "Tesseract OCR unavailable"),
            },
            None => tracing::warn!("Tesseract data not found, images will not be OCR'd"),
        }
    }

    #[cfg(not(feature = "ocr"))]
    tracing::info!("Built without the ocr feature, image OCR unavailable");

    None
}
