//! Report orchestrator.
//!
//! Single entry point that drives one report request:
//! patient lookup → reference discovery → document pipeline → Stage 1 →
//! Stage 2 → assembly.
//!
//! Every collaborator sits behind a trait object so the orchestrator can be
//! exercised end to end with mock implementations.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ConfigError, LlmProvider, LlmSettings, Settings};
use crate::patient::{HttpPatientClient, PatientDataError, PatientDataSource};
use crate::pipeline::analysis::{
    AnalysisError, AnalysisStage, DocumentReview, LlmClient, MedicalAnalysis, OllamaClient,
    OpenAiClient, RetryPolicy, TwoStageAnalyzer,
};
use crate::pipeline::discovery::{
    DocumentKind, HostMatcher, PatternMatcher, ReferenceDiscoverer, ReferenceMatcher,
};
use crate::pipeline::documents::{
    image_mime, DocumentPipeline, ExtractedDocuments, ImageAttachment, PipelineConfig,
};
use crate::pipeline::extraction::{
    build_extractor, sniff_kind, DocumentExtractor, ExtractionMethod, ExtractionOutcome,
    ExtractionStatus,
};
use crate::pipeline::fetch::HttpDocumentFetcher;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Stage named in a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    /// Reading a local input file (single-file entry points only).
    Input,
    DataFetch,
    Stage1,
    Stage2,
}

impl FailedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::DataFetch => "data-fetch",
            Self::Stage1 => "stage-1",
            Self::Stage2 => "stage-2",
        }
    }
}

impl std::fmt::Display for FailedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Cannot read input file: {0}")]
    Input(#[from] std::io::Error),

    #[error("data-fetch: {0}")]
    PatientData(#[from] PatientDataError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl ReportError {
    pub fn failed_stage(&self) -> FailedStage {
        match self {
            Self::Input(_) => FailedStage::Input,
            Self::PatientData(_) => FailedStage::DataFetch,
            Self::Analysis(e) => match e.stage() {
                AnalysisStage::Extraction => FailedStage::Stage1,
                AnalysisStage::Synthesis => FailedStage::Stage2,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One row per discovered reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub url: String,
    pub field: String,
    pub kind: DocumentKind,
    pub status: ExtractionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicalReport {
    pub patient_id: String,
    pub medical_analysis: MedicalAnalysis,
    pub files_analyzed: Vec<FileSummary>,
    pub generation_timestamp: DateTime<Utc>,
}

impl MedicalReport {
    fn assemble(
        patient_id: &str,
        analysis: MedicalAnalysis,
        documents: &ExtractedDocuments,
    ) -> Self {
        let files_analyzed = documents
            .iter()
            .map(|d| FileSummary {
                url: d.reference.url.clone(),
                field: d.reference.field.clone(),
                kind: d.resolved_kind,
                status: d.status,
            })
            .collect();
        Self {
            patient_id: patient_id.to_string(),
            medical_analysis: analysis,
            files_analyzed,
            generation_timestamp: Utc::now(),
        }
    }
}

/// Request progress, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportStage {
    Init,
    DataFetched,
    DocumentsProcessed,
    Stage1Complete,
    Stage2Complete,
    Assembled,
}

impl ReportStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::DataFetched => "data_fetched",
            Self::DocumentsProcessed => "documents_processed",
            Self::Stage1Complete => "stage1_complete",
            Self::Stage2Complete => "stage2_complete",
            Self::Assembled => "assembled",
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct ReportProcessor {
    patients: Arc<dyn PatientDataSource>,
    discoverer: ReferenceDiscoverer,
    pipeline: DocumentPipeline,
    analyzer: TwoStageAnalyzer,
}

impl ReportProcessor {
    pub fn new(
        patients: Arc<dyn PatientDataSource>,
        discoverer: ReferenceDiscoverer,
        pipeline: DocumentPipeline,
        analyzer: TwoStageAnalyzer,
    ) -> Self {
        Self {
            patients,
            discoverer,
            pipeline,
            analyzer,
        }
    }

    /// Full report for one patient. Document failures are carried as
    /// statuses; only the patient lookup and the two LLM stages are fatal.
    pub async fn generate_report(&self, user_id: &str) -> Result<MedicalReport, ReportError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("report", %request_id);
        self.run_report(user_id).instrument(span).await
    }

    async fn run_report(&self, user_id: &str) -> Result<MedicalReport, ReportError> {
        transition(ReportStage::Init);

        let record = self.patients.fetch_patient(user_id).await.map_err(|e| {
            tracing::error!(stage = FailedStage::DataFetch.as_str(), error = %e, "Report failed");
            e
        })?;
        transition(ReportStage::DataFetched);

        let references = self.discoverer.discover(record.as_value());
        tracing::info!(references = references.len(), "References discovered");
        let documents = self.pipeline.run(&references).await;
        transition(ReportStage::DocumentsProcessed);

        let raw = self.analyzer.extract_raw(&record, &documents).await?;
        transition(ReportStage::Stage1Complete);

        let analysis = self.analyzer.synthesize(&raw).await?;
        transition(ReportStage::Stage2Complete);

        let report = MedicalReport::assemble(user_id.trim(), analysis, &documents);
        transition(ReportStage::Assembled);
        Ok(report)
    }

    pub async fn analyze_file_only(
        &self,
        path: &Path,
        kind: Option<DocumentKind>,
    ) -> Result<ExtractionOutcome, ReportError> {
        analyze_file_only(self.pipeline.extractor(), path, kind).await
    }

    pub async fn review_document(
        &self,
        path: &Path,
        kind: Option<DocumentKind>,
    ) -> Result<DocumentReview, ReportError> {
        review_document(self.pipeline.extractor(), &self.analyzer, path, kind).await
    }
}

fn transition(stage: ReportStage) {
    tracing::info!(stage = stage.as_str(), "Report stage reached");
}

// ---------------------------------------------------------------------------
// Single-file entry points
// ---------------------------------------------------------------------------

struct LocalFile {
    bytes: Vec<u8>,
    kind: DocumentKind,
}

async fn read_local(path: &Path, kind: Option<DocumentKind>) -> Result<LocalFile, ReportError> {
    let bytes = tokio::fs::read(path).await?;
    let kind = match kind.unwrap_or_else(|| DocumentKind::from_path(path)) {
        DocumentKind::Unknown => sniff_kind(&bytes),
        known => known,
    };
    Ok(LocalFile { bytes, kind })
}

async fn extract_blocking(
    extractor: Arc<DocumentExtractor>,
    bytes: Vec<u8>,
    kind: DocumentKind,
) -> (Vec<u8>, ExtractionOutcome) {
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = extractor.extract(&bytes, kind);
        (bytes, outcome)
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Extraction task did not complete");
            (
                Vec::new(),
                ExtractionOutcome::failed(
                    "",
                    ExtractionMethod::None,
                    0,
                    "extraction task panicked",
                ),
            )
        }
    }
}

/// Run the extractor on a local file. `kind` defaults to the extension,
/// then to magic bytes.
pub async fn analyze_file_only(
    extractor: Arc<DocumentExtractor>,
    path: &Path,
    kind: Option<DocumentKind>,
) -> Result<ExtractionOutcome, ReportError> {
    let file = read_local(path, kind).await?;
    let (_, outcome) = extract_blocking(extractor, file.bytes, file.kind).await;
    tracing::info!(
        kind = file.kind.as_str(),
        status = outcome.status.as_str(),
        pages = outcome.page_count,
        "File extracted"
    );
    Ok(outcome)
}

/// Extract a local file and run the focused two-stage review on it.
pub async fn review_document(
    extractor: Arc<DocumentExtractor>,
    analyzer: &TwoStageAnalyzer,
    path: &Path,
    kind: Option<DocumentKind>,
) -> Result<DocumentReview, ReportError> {
    let file = read_local(path, kind).await?;
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let (bytes, outcome) = extract_blocking(extractor, file.bytes, file.kind).await;
    let image = (file.kind == DocumentKind::Image && !bytes.is_empty())
        .then(|| ImageAttachment::from_bytes(&bytes, &image_mime(&label, None, &bytes)));

    Ok(analyzer.review(&label, file.kind, outcome, image).await?)
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// LLM backend selected by `settings.provider`.
pub fn build_llm_client(settings: &LlmSettings) -> Result<Arc<dyn LlmClient>, ConfigError> {
    tracing::info!(
        provider = settings.provider.as_str(),
        model = %settings.model,
        "Using LLM backend"
    );
    let client: Arc<dyn LlmClient> = match settings.provider {
        LlmProvider::OpenAi => {
            let key = settings
                .api_key
                .as_deref()
                .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
            Arc::new(
                OpenAiClient::new(&settings.base_url, key, &settings.model, settings.timeout)
                    .map_err(|e| ConfigError::Client(e.to_string()))?,
            )
        }
        LlmProvider::Ollama => Arc::new(
            OllamaClient::new(&settings.base_url, &settings.model, settings.timeout)
                .map_err(|e| ConfigError::Client(e.to_string()))?
                .with_vision(true),
        ),
    };
    Ok(client)
}

pub fn build_analyzer(settings: &Settings) -> Result<TwoStageAnalyzer, ConfigError> {
    let llm = build_llm_client(&settings.llm)?;
    Ok(TwoStageAnalyzer::new(llm)
        .with_retry_policy(RetryPolicy::default().with_max_attempts(settings.llm.max_attempts))
        .with_max_document_chars(settings.max_document_chars)
        .with_image_attachments(settings.attach_images))
}

fn build_matcher(settings: &Settings) -> Result<Box<dyn ReferenceMatcher>, ConfigError> {
    match &settings.discovery.url_pattern {
        Some(pattern) => {
            let matcher = PatternMatcher::new(pattern).map_err(|e| ConfigError::Invalid {
                var: "DOCUMENT_URL_PATTERN",
                value: pattern.clone(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(matcher))
        }
        None => Ok(Box::new(HostMatcher::new(&settings.discovery.hosts))),
    }
}

/// Build a `ReportProcessor` with production implementations.
///
/// - Patient data: `HttpPatientClient` against `BASE_URL`
/// - Documents: `HttpDocumentFetcher` + pdf-extract / Tesseract
/// - LLM: OpenAI-compatible or Ollama
pub fn build_processor(settings: &Settings) -> Result<ReportProcessor, ConfigError> {
    let base_url = settings.patient_base_url()?;
    let patients = HttpPatientClient::new(base_url, settings.patient_timeout).map_err(|e| {
        ConfigError::Invalid {
            var: "BASE_URL",
            value: base_url.to_string(),
            reason: e.to_string(),
        }
    })?;

    let discoverer = ReferenceDiscoverer::new(build_matcher(settings)?)
        .with_max_depth(settings.discovery.max_depth);

    let fetcher = HttpDocumentFetcher::new(settings.fetch_timeout, settings.max_document_bytes)
        .map_err(|e| ConfigError::Client(e.to_string()))?;
    let extractor = build_extractor();
    if !extractor.has_ocr() {
        tracing::warn!("OCR unavailable; image documents will carry a placeholder");
    }
    let pipeline = DocumentPipeline::new(
        Arc::new(fetcher),
        Arc::new(extractor),
        PipelineConfig {
            concurrency: settings.fetch_concurrency,
            fetch_timeout: settings.fetch_timeout,
            attach_images: settings.attach_images,
            ..PipelineConfig::default()
        },
    );

    Ok(ReportProcessor::new(
        Arc::new(patients),
        discoverer,
        pipeline,
        build_analyzer(settings)?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
