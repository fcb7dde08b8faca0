//! Document pipeline: fetch + extract every discovered reference.
//!
//! Each reference runs as its own task in a `JoinSet`, gated by a semaphore.
//! Tasks share nothing mutable; results are merged after join. Whatever
//! happens to a single document (HTTP error, timeout, corrupt file, panic)
//! ends up as a status on that document's entry, and the output always has
//! exactly one entry per unique input url.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::discovery::{DocumentKind, DocumentReference};
use super::extraction::{
    sniff_image_mime, sniff_kind, DocumentExtractor, ExtractionMethod, ExtractionOutcome,
    ExtractionStatus,
};
use super::fetch::{DocumentFetcher, FetchError};
use crate::config::{
    DEFAULT_FETCH_CONCURRENCY, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_ATTACHMENT_BYTES,
};

const TASK_INCOMPLETE_DETAIL: &str = "processing task did not complete";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Image bytes kept for vision-capable LLM backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data_base64: String,
}

impl ImageAttachment {
    pub fn from_bytes(bytes: &[u8], mime_type: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data_base64: BASE64.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub reference: DocumentReference,
    /// Kind actually used for extraction after content sniffing.
    pub resolved_kind: DocumentKind,
    pub text: Option<String>,
    pub status: ExtractionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip)]
    pub image: Option<ImageAttachment>,
}

impl ExtractedDocument {
    fn fetch_failed(reference: DocumentReference, error: &FetchError) -> Self {
        Self {
            resolved_kind: reference.inferred_kind,
            reference,
            text: None,
            status: ExtractionStatus::FetchFailed,
            detail: Some(error.to_string()),
            image: None,
        }
    }

    fn incomplete(reference: DocumentReference) -> Self {
        Self {
            resolved_kind: reference.inferred_kind,
            reference,
            text: None,
            status: ExtractionStatus::ExtractFailed,
            detail: Some(TASK_INCOMPLETE_DETAIL.into()),
            image: None,
        }
    }

    fn from_outcome(
        reference: DocumentReference,
        resolved_kind: DocumentKind,
        outcome: ExtractionOutcome,
        image: Option<ImageAttachment>,
    ) -> Self {
        let text = match outcome.status {
            ExtractionStatus::Unsupported => None,
            _ => Some(outcome.text),
        };
        Self {
            reference,
            resolved_kind,
            text,
            status: outcome.status,
            detail: outcome.detail,
            image,
        }
    }

    pub fn url(&self) -> &str {
        &self.reference.url
    }

    /// Text that can be handed to the LLM as document content.
    pub fn usable_text(&self) -> Option<&str> {
        match self.status {
            ExtractionStatus::Ok => self.text.as_deref(),
            _ => None,
        }
    }
}

/// Pipeline output keyed by url.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ExtractedDocuments {
    entries: BTreeMap<String, ExtractedDocument>,
}

impl ExtractedDocuments {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&ExtractedDocument> {
        self.entries.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractedDocument> {
        self.entries.values()
    }

    pub fn count(&self, status: ExtractionStatus) -> usize {
        self.entries.values().filter(|d| d.status == status).count()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageAttachment> {
        self.entries.values().filter_map(|d| d.image.as_ref())
    }

    /// First entry for a url wins.
    pub fn insert(&mut self, document: ExtractedDocument) {
        self.entries
            .entry(document.reference.url.clone())
            .or_insert(document);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub attach_images: bool,
    pub max_attachment_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_FETCH_CONCURRENCY,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            attach_images: true,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct DocumentPipeline {
    fetcher: Arc<dyn DocumentFetcher>,
    extractor: Arc<DocumentExtractor>,
    config: PipelineConfig,
}

impl DocumentPipeline {
    pub fn new(
        fetcher: Arc<dyn DocumentFetcher>,
        extractor: Arc<DocumentExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            config,
        }
    }

    pub fn extractor(&self) -> Arc<DocumentExtractor> {
        Arc::clone(&self.extractor)
    }

    /// Fetch and extract every reference. Never fails; partial success is
    /// normal. Dropping the returned future aborts in-flight downloads.
    pub async fn run(&self, references: &[DocumentReference]) -> ExtractedDocuments {
        let mut documents = ExtractedDocuments::default();
        if references.is_empty() {
            return documents;
        }

        let scratch = match tempfile::Builder::new().prefix("medreport-").tempdir() {
            Ok(dir) => Arc::new(dir),
            Err(e) => {
                tracing::error!(error = %e, "Cannot create scratch directory");
                let error = FetchError::Storage(e);
                for reference in references {
                    documents.insert(ExtractedDocument::fetch_failed(reference.clone(), &error));
                }
                return documents;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut spawned = HashSet::new();

        for reference in references {
            if !spawned.insert(reference.url.as_str()) {
                continue;
            }
            let reference = reference.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let extractor = Arc::clone(&self.extractor);
            let semaphore = Arc::clone(&semaphore);
            let scratch = Arc::clone(&scratch);
            let config = self.config.clone();

            tasks.spawn(async move {
                // The semaphore is never closed, so acquire only fails if it were.
                let _permit = semaphore.acquire_owned().await.ok();
                process_reference(reference, fetcher.as_ref(), extractor, &scratch, &config).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(document) => documents.insert(document),
                Err(e) => tracing::warn!(error = %e, "Document task did not complete"),
            }
        }

        for reference in references {
            if !documents.contains(&reference.url) {
                documents.insert(ExtractedDocument::incomplete(reference.clone()));
            }
        }

        tracing::info!(
            total = documents.len(),
            ok = documents.count(ExtractionStatus::Ok),
            fetch_failed = documents.count(ExtractionStatus::FetchFailed),
            extract_failed = documents.count(ExtractionStatus::ExtractFailed),
            unsupported = documents.count(ExtractionStatus::Unsupported),
            "Documents processed"
        );

        documents
    }
}

async fn process_reference(
    reference: DocumentReference,
    fetcher: &dyn DocumentFetcher,
    extractor: Arc<DocumentExtractor>,
    scratch: &TempDir,
    config: &PipelineConfig,
) -> ExtractedDocument {
    let fetched = match tokio::time::timeout(
        config.fetch_timeout,
        fetcher.fetch(&reference, scratch.path()),
    )
    .await
    {
        Ok(Ok(fetched)) => fetched,
        Ok(Err(e)) => {
            tracing::warn!(url = %reference.url, error = %e, "Document fetch failed");
            return ExtractedDocument::fetch_failed(reference, &e);
        }
        Err(_) => {
            let e = FetchError::Timeout(config.fetch_timeout);
            tracing::warn!(url = %reference.url, error = %e, "Document fetch failed");
            return ExtractedDocument::fetch_failed(reference, &e);
        }
    };

    let bytes = match fetched.read_bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(url = %reference.url, error = %e, "Cannot read downloaded document");
            return ExtractedDocument::fetch_failed(reference, &e);
        }
    };
    let content_type = fetched.content_type().map(str::to_string);
    drop(fetched);

    let resolved_kind = resolve_kind(&reference, content_type.as_deref(), &bytes);
    let image = (config.attach_images
        && resolved_kind == DocumentKind::Image
        && bytes.len() <= config.max_attachment_bytes)
        .then(|| {
            let mime = image_mime(&reference.url, content_type.as_deref(), &bytes);
            ImageAttachment::from_bytes(&bytes, &mime)
        });

    let outcome =
        match tokio::task::spawn_blocking(move || extractor.extract(&bytes, resolved_kind)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(url = %reference.url, error = %e, "Extraction task panicked");
                ExtractionOutcome::failed("", ExtractionMethod::None, 0, TASK_INCOMPLETE_DETAIL)
            }
        };

    tracing::info!(
        url = %reference.url,
        kind = resolved_kind.as_str(),
        status = outcome.status.as_str(),
        "Document processed"
    );

    ExtractedDocument::from_outcome(reference, resolved_kind, outcome, image)
}

/// Inferred kind when conclusive, else the response content type, else magic bytes.
fn resolve_kind(
    reference: &DocumentReference,
    content_type: Option<&str>,
    bytes: &[u8],
) -> DocumentKind {
    if reference.inferred_kind != DocumentKind::Unknown {
        return reference.inferred_kind;
    }
    let from_header = content_type
        .map(DocumentKind::from_content_type)
        .unwrap_or(DocumentKind::Unknown);
    if from_header != DocumentKind::Unknown {
        return from_header;
    }
    sniff_kind(bytes)
}

pub(crate) fn image_mime(url: &str, content_type: Option<&str>, bytes: &[u8]) -> String {
    if let Some(ct) = content_type {
        let essence = ct.split(';').next().unwrap_or_default().trim();
        if essence.starts_with("image/") {
            return essence.to_string();
        }
    }
    if let Some(mime) = sniff_image_mime(bytes) {
        return mime.to_string();
    }
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    mime_guess::from_path(Path::new(&path))
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::{MockOcrEngine, PdfTextExtractor, OCR_UNAVAILABLE_PLACEHOLDER};
    use crate::pipeline::fetch::FetchedDocument;
    use crate::test_support::{make_blank_pdf, make_test_pdf, make_test_png};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Script {
        Body(Vec<u8>, Option<&'static str>),
        Status(u16),
        Hang,
        Panic,
    }

    /// Fetcher that answers from a url → script table and records what it saw.
    struct ScriptedFetcher {
        scripts: HashMap<String, Script>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        scratch_seen: Mutex<Option<PathBuf>>,
    }

    impl ScriptedFetcher {
        fn new(scripts: Vec<(&str, Script)>) -> Self {
            Self {
                scripts: scripts.into_iter().map(|(u, s)| (u.to_string(), s)).collect(),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                scratch_seen: Mutex::new(None),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl DocumentFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            reference: &DocumentReference,
            scratch: &Path,
        ) -> Result<FetchedDocument, FetchError> {
            *self.scratch_seen.lock().unwrap() = Some(scratch.to_path_buf());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.scripts.get(&reference.url) {
                Some(Script::Body(bytes, ct)) => {
                    FetchedDocument::from_bytes_in(scratch, bytes, *ct)
                }
                Some(Script::Status(status)) => Err(FetchError::Http { status: *status }),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(FetchError::Network("unreachable".into()))
                }
                Some(Script::Panic) => panic!("fetcher bug"),
                None => Err(FetchError::Http { status: 404 }),
            }
        }
    }

    fn reference(url: &str, kind: DocumentKind) -> DocumentReference {
        DocumentReference {
            url: url.to_string(),
            field: "files".into(),
            inferred_kind: kind,
        }
    }

    fn pipeline(fetcher: Arc<dyn DocumentFetcher>, config: PipelineConfig) -> DocumentPipeline {
        let extractor = DocumentExtractor::new(Box::new(PdfTextExtractor));
        DocumentPipeline::new(fetcher, Arc::new(extractor), config)
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            fetch_timeout: Duration::from_millis(300),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn every_reference_gets_exactly_one_entry() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            (
                "https://h/a.pdf",
                Script::Body(make_test_pdf("Sodium 140 mmol/L"), Some("application/pdf")),
            ),
            ("https://h/b.pdf", Script::Status(500)),
            ("https://h/c.pdf", Script::Hang),
            ("https://h/d.bin", Script::Body(b"PK\x03\x04 zip".to_vec(), None)),
            ("https://h/e.pdf", Script::Body(make_blank_pdf(), None)),
            ("https://h/f.pdf", Script::Panic),
        ]));
        let refs = vec![
            reference("https://h/a.pdf", DocumentKind::Pdf),
            reference("https://h/b.pdf", DocumentKind::Pdf),
            reference("https://h/c.pdf", DocumentKind::Pdf),
            reference("https://h/d.bin", DocumentKind::Unknown),
            reference("https://h/e.pdf", DocumentKind::Pdf),
            reference("https://h/f.pdf", DocumentKind::Pdf),
            reference("https://h/a.pdf", DocumentKind::Pdf),
        ];

        let docs = pipeline(fetcher, fast_config()).run(&refs).await;

        assert_eq!(docs.len(), 6);
        let status = |url: &str| docs.get(url).unwrap().status;
        assert_eq!(status("https://h/a.pdf"), ExtractionStatus::Ok);
        assert_eq!(status("https://h/b.pdf"), ExtractionStatus::FetchFailed);
        assert_eq!(status("https://h/c.pdf"), ExtractionStatus::FetchFailed);
        assert_eq!(status("https://h/d.bin"), ExtractionStatus::Unsupported);
        assert_eq!(status("https://h/e.pdf"), ExtractionStatus::ExtractFailed);
        assert_eq!(status("https://h/f.pdf"), ExtractionStatus::ExtractFailed);

        assert!(docs.get("https://h/a.pdf").unwrap().usable_text().unwrap().contains("Sodium"));
        assert!(docs.get("https://h/b.pdf").unwrap().text.is_none());
        let timed_out = docs.get("https://h/c.pdf").unwrap();
        assert!(timed_out.detail.as_deref().unwrap().contains("Timed out"));
        assert!(docs.get("https://h/d.bin").unwrap().text.is_none());
        assert_eq!(docs.get("https://h/e.pdf").unwrap().text.as_deref(), Some(""));
        assert_eq!(
            docs.get("https://h/f.pdf").unwrap().detail.as_deref(),
            Some(TASK_INCOMPLETE_DETAIL)
        );
    }

    #[tokio::test]
    async fn no_references_yields_empty_mapping() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let docs = pipeline(fetcher, fast_config()).run(&[]).await;
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_resolved_from_content_type_and_image_attached() {
        let png = make_test_png(8, 8);
        let fetcher = Arc::new(ScriptedFetcher::new(vec![(
            "https://h/raw/upload/blob",
            Script::Body(png.clone(), Some("image/png")),
        )]));
        let refs = vec![reference("https://h/raw/upload/blob", DocumentKind::Unknown)];

        let docs = pipeline(fetcher, fast_config()).run(&refs).await;
        let doc = docs.get("https://h/raw/upload/blob").unwrap();

        assert_eq!(doc.resolved_kind, DocumentKind::Image);
        assert_eq!(doc.status, ExtractionStatus::ExtractFailed);
        assert_eq!(doc.text.as_deref(), Some(OCR_UNAVAILABLE_PLACEHOLDER));
        let image = doc.image.as_ref().unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(BASE64.decode(&image.data_base64).unwrap(), png);
        assert!(image.data_url().starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn unknown_kind_resolved_from_magic_bytes() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![(
            "https://h/raw/upload/blob",
            Script::Body(make_test_pdf("Potassium 4.1"), Some("application/octet-stream")),
        )]));
        let refs = vec![reference("https://h/raw/upload/blob", DocumentKind::Unknown)];

        let docs = pipeline(fetcher, fast_config()).run(&refs).await;
        let doc = docs.get("https://h/raw/upload/blob").unwrap();
        assert_eq!(doc.resolved_kind, DocumentKind::Pdf);
        assert_eq!(doc.status, ExtractionStatus::Ok);
    }

    #[tokio::test]
    async fn attachments_respect_switch_and_size_cap() {
        let png = make_test_png(8, 8);
        let scripts = || {
            vec![("https://h/scan.png", Script::Body(make_test_png(8, 8), None))]
        };
        let refs = vec![reference("https://h/scan.png", DocumentKind::Image)];

        let off = PipelineConfig {
            attach_images: false,
            ..fast_config()
        };
        let docs = pipeline(Arc::new(ScriptedFetcher::new(scripts())), off).run(&refs).await;
        assert!(docs.get("https://h/scan.png").unwrap().image.is_none());

        let capped = PipelineConfig {
            max_attachment_bytes: png.len() - 1,
            ..fast_config()
        };
        let docs = pipeline(Arc::new(ScriptedFetcher::new(scripts())), capped).run(&refs).await;
        assert!(docs.get("https://h/scan.png").unwrap().image.is_none());
    }

    #[tokio::test]
    async fn image_ocr_runs_when_engine_present() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![(
            "https://h/scan.jpg",
            Script::Body(make_test_png(8, 8), None),
        )]));
        let extractor = DocumentExtractor::new(Box::new(PdfTextExtractor))
            .with_ocr_engine(Box::new(MockOcrEngine::new("TSH 2.1 mIU/L", 0.9)));
        let pipeline = DocumentPipeline::new(fetcher, Arc::new(extractor), fast_config());

        let docs = pipeline
            .run(&[reference("https://h/scan.jpg", DocumentKind::Image)])
            .await;
        let doc = docs.get("https://h/scan.jpg").unwrap();
        assert_eq!(doc.status, ExtractionStatus::Ok);
        assert_eq!(doc.usable_text(), Some("TSH 2.1 mIU/L"));
        // Magic bytes say PNG even though the url says jpg.
        assert_eq!(doc.image.as_ref().unwrap().mime_type, "image/png");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let urls: Vec<String> = (0..8).map(|i| format!("https://h/{i}.pdf")).collect();
        let fetcher = Arc::new(
            ScriptedFetcher::new(urls.iter().map(|u| (u.as_str(), Script::Status(503))).collect())
                .with_delay(Duration::from_millis(40)),
        );
        let refs: Vec<_> = urls.iter().map(|u| reference(u, DocumentKind::Pdf)).collect();
        let config = PipelineConfig {
            concurrency: 2,
            ..fast_config()
        };

        let docs = pipeline(Arc::clone(&fetcher) as Arc<dyn DocumentFetcher>, config)
            .run(&refs)
            .await;

        assert_eq!(docs.len(), 8);
        assert_eq!(docs.count(ExtractionStatus::FetchFailed), 8);
        let peak = fetcher.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak in-flight fetches was {peak}");
    }

    #[tokio::test]
    async fn scratch_directory_removed_after_run() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![(
            "https://h/a.pdf",
            Script::Body(make_test_pdf("Urea 5.0"), None),
        )]));
        let docs = pipeline(Arc::clone(&fetcher) as Arc<dyn DocumentFetcher>, fast_config())
            .run(&[reference("https://h/a.pdf", DocumentKind::Pdf)])
            .await;
        assert_eq!(docs.len(), 1);

        let scratch = fetcher.scratch_seen.lock().unwrap().clone().unwrap();
        assert!(!scratch.exists(), "scratch dir {scratch:?} left behind");
    }

    #[tokio::test]
    async fn dropping_the_run_cancels_fetches_and_cleans_scratch() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![("https://h/slow.pdf", Script::Hang)]));
        let config = PipelineConfig {
            fetch_timeout: Duration::from_secs(3600),
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(Arc::clone(&fetcher) as Arc<dyn DocumentFetcher>, config);

        let refs = [reference("https://h/slow.pdf", DocumentKind::Pdf)];
        let result = tokio::time::timeout(Duration::from_millis(100), pipeline.run(&refs)).await;
        assert!(result.is_err());

        // Aborted tasks are dropped on the next scheduler pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let scratch = fetcher.scratch_seen.lock().unwrap().clone().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn mime_prefers_header_then_magic_then_extension() {
        assert_eq!(image_mime("https://h/a.jpg", Some("image/webp; q=1"), b""), "image/webp");
        assert_eq!(image_mime("https://h/a.jpg", None, &[0x89, 0x50, 0x4E, 0x47]), "image/png");
        assert_eq!(image_mime("https://h/a.gif?x=1", None, b"????"), "image/gif");
        assert_eq!(image_mime("https://h/blob", None, b"????"), "image/jpeg");
    }
}
