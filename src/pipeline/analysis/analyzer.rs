//! Two-stage LLM protocol: raw extraction, then structured synthesis.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::llm::{CompletionRequest, LlmClient};
use super::parser::{parse_raw_extraction, parse_sections, ParseOutcome};
use super::prompt::{
    build_extraction_prompt, build_review_extraction_prompt, build_review_synthesis_prompt,
    build_synthesis_prompt, EXTRACTION_SYSTEM_PROMPT, REVIEW_EXTRACTION_SYSTEM_PROMPT,
    REVIEW_SYNTHESIS_SYSTEM_PROMPT, SYNTHESIS_SYSTEM_PROMPT,
};
use super::sections::{backfill_sections, report_section_keys, MedicalAnalysis, REVIEW_SECTION_KEYS};
use super::{AnalysisError, AnalysisStage};
use crate::config::{DEFAULT_LLM_MAX_ATTEMPTS, DEFAULT_MAX_DOCUMENT_CHARS};
use crate::patient::PatientRecord;
use crate::pipeline::discovery::DocumentKind;
use crate::pipeline::documents::{ExtractedDocuments, ImageAttachment};
use crate::pipeline::extraction::ExtractionOutcome;

const EXTRACTION_MAX_TOKENS: u32 = 4096;
const SYNTHESIS_MAX_TOKENS: u32 = 8192;

/// Stage 1 output: loosely structured clinical facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMedicalData(Map<String, Value>);

impl RawMedicalData {
    pub fn new(facts: Map<String, Value>) -> Self {
        Self(facts)
    }

    pub fn facts(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_default()
    }
}

/// How often and how patiently each stage retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per stage, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LLM_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn no_backoff(mut self) -> Self {
        self.initial_backoff = Duration::ZERO;
        self
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Focused analysis of one supplied file.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentReview {
    pub extraction: ExtractionOutcome,
    pub analysis: Map<String, Value>,
}

pub struct TwoStageAnalyzer {
    llm: Arc<dyn LlmClient>,
    policy: RetryPolicy,
    max_document_chars: usize,
    attach_images: bool,
}

impl TwoStageAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            policy: RetryPolicy::default(),
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            attach_images: true,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_document_chars(mut self, max_chars: usize) -> Self {
        self.max_document_chars = max_chars;
        self
    }

    pub fn with_image_attachments(mut self, attach: bool) -> Self {
        self.attach_images = attach;
        self
    }

    fn images_for(&self, images: impl Iterator<Item = ImageAttachment>) -> Vec<ImageAttachment> {
        if self.attach_images && self.llm.supports_images() {
            images.collect()
        } else {
            Vec::new()
        }
    }

    /// Stage 1: record + documents → raw facts.
    pub async fn extract_raw(
        &self,
        record: &PatientRecord,
        documents: &ExtractedDocuments,
    ) -> Result<RawMedicalData, AnalysisError> {
        let prompt = build_extraction_prompt(record, documents, self.max_document_chars);
        let mut request = CompletionRequest::new(EXTRACTION_SYSTEM_PROMPT, prompt)
            .with_images(self.images_for(documents.images().cloned()));
        request.max_tokens = EXTRACTION_MAX_TOKENS;

        tracing::info!(
            model = self.llm.model(),
            documents = documents.len(),
            images = request.images.len(),
            "Stage 1 extraction"
        );
        let facts = self
            .call_with_retry(AnalysisStage::Extraction, &request, parse_raw_extraction)
            .await?;
        Ok(RawMedicalData::new(facts))
    }

    /// Stage 2: raw facts → the ten report sections.
    pub async fn synthesize(&self, raw: &RawMedicalData) -> Result<MedicalAnalysis, AnalysisError> {
        let mut request =
            CompletionRequest::new(SYNTHESIS_SYSTEM_PROMPT, build_synthesis_prompt(raw)).json();
        request.max_tokens = SYNTHESIS_MAX_TOKENS;

        tracing::info!(
            model = self.llm.model(),
            facts = raw.facts().len(),
            "Stage 2 synthesis"
        );
        let keys = report_section_keys();
        let sections = self
            .call_with_retry(AnalysisStage::Synthesis, &request, |text| parse_sections(text, &keys))
            .await?;

        let (analysis, backfilled) = MedicalAnalysis::from_sections(sections);
        debug_assert!(backfilled.is_empty(), "parse_sections already backfilled");
        Ok(analysis)
    }

    /// Both stages for one document, with the nine review sections.
    pub async fn review(
        &self,
        label: &str,
        kind: DocumentKind,
        extraction: ExtractionOutcome,
        image: Option<ImageAttachment>,
    ) -> Result<DocumentReview, AnalysisError> {
        let prompt =
            build_review_extraction_prompt(label, kind, &extraction, self.max_document_chars);
        let mut request = CompletionRequest::new(REVIEW_EXTRACTION_SYSTEM_PROMPT, prompt)
            .with_images(self.images_for(image.into_iter()));
        request.max_tokens = EXTRACTION_MAX_TOKENS;

        let facts = self
            .call_with_retry(AnalysisStage::Extraction, &request, parse_raw_extraction)
            .await?;
        let raw = RawMedicalData::new(facts);

        let mut request = CompletionRequest::new(
            REVIEW_SYNTHESIS_SYSTEM_PROMPT,
            build_review_synthesis_prompt(&raw),
        )
        .json();
        request.max_tokens = SYNTHESIS_MAX_TOKENS;
        let sections = self
            .call_with_retry(AnalysisStage::Synthesis, &request, |text| {
                parse_sections(text, &REVIEW_SECTION_KEYS)
            })
            .await?;
        let (analysis, _) = backfill_sections(sections, &REVIEW_SECTION_KEYS);

        Ok(DocumentReview {
            extraction,
            analysis,
        })
    }

    /// Call the LLM until `parse` yields something usable or attempts run
    /// out. Every attempt resends the same request. Transport, API and
    /// parse failures all draw on the same attempt budget.
    async fn call_with_retry<T, P>(
        &self,
        stage: AnalysisStage,
        request: &CompletionRequest,
        parse: P,
    ) -> Result<T, AnalysisError>
    where
        P: Fn(&str) -> ParseOutcome<T>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let failure = match self.llm.complete(request).await {
                Ok(response) => {
                    let cleaned = super::sanitize::sanitize_llm_output(&response);
                    match parse(&cleaned) {
                        ParseOutcome::Complete(value) => return Ok(value),
                        ParseOutcome::Partial { value, notes } => {
                            tracing::warn!(
                                stage = stage.as_str(),
                                attempt,
                                notes = %notes.join("; "),
                                "LLM output accepted after repair"
                            );
                            return Ok(value);
                        }
                        ParseOutcome::Failed(reason) => AnalysisError::Unparsable {
                            stage,
                            attempts: attempt,
                            reason,
                        },
                    }
                }
                Err(e) => {
                    if !e.is_retryable() {
                        tracing::warn!(
                            stage = stage.as_str(),
                            attempt,
                            error = %e,
                            "LLM call failed with a non-transient error"
                        );
                    }
                    AnalysisError::Llm {
                        stage,
                        attempts: attempt,
                        source: e,
                    }
                }
            };

            if attempt >= max_attempts {
                tracing::error!(
                    stage = stage.as_str(),
                    attempts = attempt,
                    error = %failure,
                    "LLM stage failed"
                );
                return Err(failure);
            }

            let delay = self.policy.backoff_after(attempt);
            tracing::warn!(
                stage = stage.as_str(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure,
                "LLM attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
