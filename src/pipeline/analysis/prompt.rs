use std::fmt::Write as _;

use super::analyzer::RawMedicalData;
use super::sanitize::sanitize_for_llm;
use super::sections::{ReportSection, REVIEW_SECTION_KEYS};
use crate::patient::PatientRecord;
use crate::pipeline::discovery::DocumentKind;
use crate::pipeline::documents::{ExtractedDocument, ExtractedDocuments};
use crate::pipeline::extraction::{ExtractionOutcome, ExtractionStatus};

/// Phrase every failed document note starts with.
pub const DOCUMENT_UNAVAILABLE: &str = "document unavailable";

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a clinical data abstractor. You read a patient's registration record
and the text of their attached medical documents, and you collect every
clinically relevant fact into one JSON object.

RULES:
1. Record only what the record or documents state. Do not diagnose or advise.
2. Keep values verbatim with their units and dates.
3. When sources disagree, keep both values and say where each came from.
4. A document marked as unavailable contributed nothing; do not guess its content.
5. Images may be attached. Read any visible text or findings from them.

OUTPUT: a single JSON object. Group facts under keys such as demographics,
history, medications, allergies, vital_signs, laboratory_results, imaging,
examination, lifestyle and document_notes. No prose outside the object.
"#;

pub const SYNTHESIS_SYSTEM_PROMPT: &str = r#"
You are a clinical report writer. You receive facts already extracted from a
patient's record and documents, and you organise them into a structured
clinical report for a treating physician.

RULES:
1. Base every statement on the provided facts. State plainly when data is missing.
2. Show inputs and formulas for any calculation you perform.
3. Keep recommendations specific to this patient.
4. Output exactly one JSON object with exactly the requested keys.
"#;

pub const REVIEW_EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a clinical data abstractor reviewing one medical document. Collect
every clinically relevant fact it contains into one JSON object, verbatim
with units and dates. Do not add facts the document does not state.
"#;

pub const REVIEW_SYNTHESIS_SYSTEM_PROMPT: &str = r#"
You are a clinical reviewer. Organise facts extracted from one medical
document into a focused review. Base every statement on the facts given and
output exactly one JSON object with exactly the requested keys.
"#;

/// Stage 1 input: the registration record plus one block per document.
pub fn build_extraction_prompt(
    record: &PatientRecord,
    documents: &ExtractedDocuments,
    max_chars: usize,
) -> String {
    let mut prompt = String::new();
    let record_json = sanitize_for_llm(&record.to_pretty_json(), max_chars, "patient_record");

    let _ = writeln!(prompt, "<patient_record>\n{record_json}\n</patient_record>\n");

    if documents.is_empty() {
        prompt.push_str("No documents are attached to this patient record.\n");
    } else {
        let _ = writeln!(prompt, "Attached documents ({}):\n", documents.len());
        for (index, document) in documents.iter().enumerate() {
            let _ = writeln!(
                prompt,
                "<document index=\"{}\" field=\"{}\" kind=\"{}\">\n{}\n</document>\n",
                index + 1,
                document.reference.field,
                document.resolved_kind,
                document_body(document, max_chars)
            );
        }
    }

    prompt.push_str(
        "Extract every clinically relevant fact from the record and documents above \
         into a single JSON object.",
    );
    prompt
}

fn document_body(document: &ExtractedDocument, max_chars: usize) -> String {
    if let Some(text) = document.usable_text() {
        return sanitize_for_llm(text, max_chars, &document.reference.field);
    }

    let reason = match document.status {
        ExtractionStatus::FetchFailed => "the file could not be downloaded",
        ExtractionStatus::Unsupported => "the file type is not supported",
        _ => "no text could be extracted from the file",
    };
    let image_note = if document.image.is_some() {
        " The image itself is attached for visual review."
    } else {
        ""
    };
    format!("[{DOCUMENT_UNAVAILABLE}: {reason}.{image_note}]")
}

/// Stage 2 input: the Stage 1 facts plus the section contract.
pub fn build_synthesis_prompt(raw: &RawMedicalData) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "<extracted_facts>\n{}\n</extracted_facts>\n", raw.to_pretty_json());
    prompt.push_str("Write the clinical report as a JSON object with exactly these ten keys:\n");
    for section in ReportSection::ALL {
        let _ = writeln!(prompt, "- \"{}\": {}", section.key(), section.brief());
    }
    prompt.push_str(
        "\nEach value may be a string, list or nested object. If the facts do not \
         support a section, set it to {\"status\": \"insufficient_data\", \"note\": \"...\"}.",
    );
    prompt
}

/// Review Stage 1 input for a single supplied document.
pub fn build_review_extraction_prompt(
    label: &str,
    kind: DocumentKind,
    outcome: &ExtractionOutcome,
    max_chars: usize,
) -> String {
    let body = if outcome.is_ok() {
        sanitize_for_llm(&outcome.text, max_chars, label)
    } else {
        format!("[{DOCUMENT_UNAVAILABLE}: no text could be extracted from the file.]")
    };
    format!(
        "<document name=\"{label}\" kind=\"{kind}\">\n{body}\n</document>\n\n\
         Extract every clinically relevant fact from this document into a single JSON object."
    )
}

/// Review Stage 2 input.
pub fn build_review_synthesis_prompt(raw: &RawMedicalData) -> String {
    let keys = REVIEW_SECTION_KEYS
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "<extracted_facts>\n{}\n</extracted_facts>\n\n\
         Write a focused review of this document as a JSON object with exactly these keys: {keys}. \
         Use {{\"status\": \"insufficient_data\"}} for any key the facts do not support.",
        raw.to_pretty_json()
    )
}
