//! Lenient parsing of LLM output.
//!
//! Models wrap JSON in prose, fence it, nest it under an extra key or leave
//! trailing commas. Parsing accepts all of that and reports how much repair
//! was needed through `ParseOutcome`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::sections::backfill_sections;

/// Key Stage 1 prose is stored under when the model ignored the JSON format.
pub const UNSTRUCTURED_KEY: &str = "unstructured_extraction";

/// Wrapper keys models sometimes nest the section object under.
const WRAPPER_KEYS: &[&str] = &["medical_analysis", "analysis", "report", "sections"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// Parsed as asked.
    Complete(T),
    /// Usable after repair; `notes` say what was patched.
    Partial { value: T, notes: Vec<String> },
    /// Nothing usable; worth another attempt.
    Failed(String),
}

impl<T> ParseOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Stage 1: any JSON object is taken as is; other non-empty text is kept
/// verbatim under `unstructured_extraction`.
pub fn parse_raw_extraction(response: &str) -> ParseOutcome<Map<String, Value>> {
    let text = response.trim();
    if text.is_empty() {
        return ParseOutcome::Failed("empty response".into());
    }

    match find_json_object(text) {
        Some((object, false)) => ParseOutcome::Complete(object),
        Some((object, true)) => ParseOutcome::Partial {
            value: object,
            notes: vec!["repaired malformed JSON".into()],
        },
        None => {
            let mut object = Map::new();
            object.insert(UNSTRUCTURED_KEY.into(), Value::String(text.to_string()));
            ParseOutcome::Partial {
                value: object,
                notes: vec!["response was not JSON; kept as unstructured text".into()],
            }
        }
    }
}

/// Stage 2 and review synthesis: a JSON object reduced to exactly `keys`,
/// with missing sections backfilled. An object carrying none of `keys` is a
/// failure, not a fully backfilled report.
pub fn parse_sections(
    response: &str,
    keys: &[&'static str],
) -> ParseOutcome<Map<String, Value>> {
    let Some((object, repaired)) = find_json_object(response) else {
        return ParseOutcome::Failed("no JSON object in response".into());
    };

    let object = unwrap_nested(object, keys);
    if !keys.iter().any(|k| object.contains_key(*k)) {
        return ParseOutcome::Failed("no known section keys in response".into());
    }
    let (sections, backfilled) = backfill_sections(object, keys);

    let mut notes = Vec::new();
    if repaired {
        notes.push("repaired malformed JSON".to_string());
    }
    if !backfilled.is_empty() {
        notes.push(format!("backfilled: {}", backfilled.join(", ")));
    }

    if notes.is_empty() {
        ParseOutcome::Complete(sections)
    } else {
        ParseOutcome::Partial {
            value: sections,
            notes,
        }
    }
}

/// Descend into a wrapper key when the top level has none of `keys`.
fn unwrap_nested(mut object: Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    if keys.iter().any(|k| object.contains_key(*k)) {
        return object;
    }
    for wrapper in WRAPPER_KEYS {
        if let Some(Value::Object(inner)) = object.remove(*wrapper) {
            return inner;
        }
    }
    object
}

/// Locate a JSON object in free text. The flag is true when trailing commas
/// had to be removed.
pub fn find_json_object(text: &str) -> Option<(Map<String, Value>, bool)> {
    static TRAILING_COMMA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

    let text = text.trim();
    if let Some(object) = parse_object(text) {
        return Some((object, false));
    }

    if let Some(block) = fenced_json_block(text) {
        if let Some(object) = parse_object(block) {
            return Some((object, false));
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];
    if let Some(object) = parse_object(candidate) {
        return Some((object, false));
    }

    let repaired = TRAILING_COMMA_RE.replace_all(candidate, "$1");
    parse_object(&repaired).map(|object| (object, true))
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let len = text[start..].find("```")?;
    Some(text[start..start + len].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::sections::{report_section_keys, REVIEW_SECTION_KEYS};

    fn full_sections_json() -> String {
        let object: Map<String, Value> = report_section_keys()
            .iter()
            .map(|k| (k.to_string(), Value::String(format!("content for {k}"))))
            .collect();
        Value::Object(object).to_string()
    }

    #[test]
    fn raw_extraction_plain_json_is_complete() {
        let outcome = parse_raw_extraction(r#"{"vitals": {"bp": "130/85"}}"#);
        match outcome {
            ParseOutcome::Complete(object) => assert_eq!(object["vitals"]["bp"], "130/85"),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn raw_extraction_prose_is_partial_unstructured() {
        let outcome = parse_raw_extraction("Patient is a 54 year old with hypertension.");
        match outcome {
            ParseOutcome::Partial { value, .. } => {
                assert_eq!(
                    value[UNSTRUCTURED_KEY],
                    "Patient is a 54 year old with hypertension."
                );
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn raw_extraction_empty_fails() {
        assert!(parse_raw_extraction("  \n ").is_failed());
    }

    #[test]
    fn json_inside_prose_and_fences_found() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nLet me know.";
        let (object, repaired) = find_json_object(text).unwrap();
        assert_eq!(object["a"], 1);
        assert!(!repaired);

        let (object, _) = find_json_object("Result: {\"b\": [1, 2]} done").unwrap();
        assert_eq!(object["b"][1], 2);
    }

    #[test]
    fn trailing_commas_repaired() {
        let (object, repaired) =
            find_json_object("{\"a\": [1, 2,], \"b\": {\"c\": 3,},}").unwrap();
        assert!(repaired);
        assert_eq!(object["a"][1], 2);
        assert_eq!(object["b"]["c"], 3);
    }

    #[test]
    fn non_object_json_is_not_an_object() {
        assert!(find_json_object("[1, 2, 3]").is_none());
        assert!(find_json_object("no braces here").is_none());
        assert!(find_json_object("} backwards {").is_none());
    }

    #[test]
    fn sections_complete_when_all_present() {
        let keys = report_section_keys();
        let outcome = parse_sections(&full_sections_json(), &keys);
        match outcome {
            ParseOutcome::Complete(sections) => assert_eq!(sections.len(), 10),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn missing_red_flags_backfilled_as_partial() {
        let keys = report_section_keys();
        let mut object: Map<String, Value> =
            serde_json::from_str(&full_sections_json()).unwrap();
        object.remove("red_flags_emergency_return");

        match parse_sections(&Value::Object(object).to_string(), &keys) {
            ParseOutcome::Partial { value, notes } => {
                assert_eq!(value.len(), 10);
                assert_eq!(value["red_flags_emergency_return"]["status"], "insufficient_data");
                assert!(notes.iter().any(|n| n.contains("red_flags_emergency_return")));
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn sections_nested_under_wrapper_are_unwrapped() {
        let keys = report_section_keys();
        let wrapped = format!("{{\"medical_analysis\": {}}}", full_sections_json());
        match parse_sections(&wrapped, &keys) {
            ParseOutcome::Complete(sections) => {
                assert_eq!(sections["patient_info"], "content for patient_info");
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn sections_without_json_fail() {
        assert!(parse_sections("I cannot help with that.", &REVIEW_SECTION_KEYS).is_failed());
    }

    #[test]
    fn object_without_any_section_key_fails() {
        let keys = report_section_keys();
        assert!(parse_sections("{\"error\": \"oops\"}", &REVIEW_SECTION_KEYS).is_failed());
        assert!(parse_sections("{}", &keys).is_failed());
        assert!(parse_sections("{\"analysis\": {\"note\": \"x\"}}", &keys).is_failed());
    }

    #[test]
    fn single_known_key_backfills_the_rest() {
        let text = r#"{"vital_signs": {"bp": "120/80"}, "x": 1}"#;
        match parse_sections(text, &REVIEW_SECTION_KEYS) {
            ParseOutcome::Partial { value, .. } => {
                assert_eq!(value.len(), 9);
                assert_eq!(value["vital_signs"]["bp"], "120/80");
                assert!(value.get("x").is_none());
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }
}
