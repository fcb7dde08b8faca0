//! Reference discovery.
//!
//! Walks an arbitrarily shaped patient record and collects every string that
//! points at a hosted document. The walk is an explicit worklist, so deeply
//! nested payloads cannot overflow the stack, and it is bounded by a maximum
//! depth. Results keep first-seen order and are deduplicated by url.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::DEFAULT_MAX_DISCOVERY_DEPTH;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "bmp", "heic",
];

/// Sibling keys that may declare the content type of a url in the same mapping.
const DECLARED_TYPE_KEYS: &[&str] = &[
    "content_type",
    "contentType",
    "mime_type",
    "mimeType",
    "mimetype",
    "format",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Image,
    Unknown,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }

    /// Kind from a bare extension such as `pdf` or `JPG`.
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        if ext == "pdf" {
            Self::Pdf
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::Unknown
        }
    }

    /// Kind from a MIME type (`application/pdf`, `image/png; q=1`) or a short
    /// format name (`pdf`, `jpg`).
    pub fn from_content_type(declared: &str) -> Self {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" | "application/x-pdf" => Self::Pdf,
            e if e.starts_with("image/") => Self::Image,
            e => Self::from_extension(e),
        }
    }

    /// Kind from the path of a url: suffix first, then storage path markers.
    pub fn from_url(url: &str) -> Self {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_ascii_lowercase(),
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase(),
        };

        let by_suffix = path
            .rsplit('/')
            .next()
            .and_then(|segment| segment.rsplit_once('.'))
            .map(|(_, ext)| Self::from_extension(ext))
            .unwrap_or(Self::Unknown);

        if by_suffix != Self::Unknown {
            by_suffix
        } else if path.contains("/pdf/") {
            Self::Pdf
        } else if path.contains("/image/") {
            Self::Image
        } else {
            Self::Unknown
        }
    }

    /// Kind from a local file's extension.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown document kind {0:?} (expected pdf, image or unknown)")]
pub struct ParseKindError(String);

impl FromStr for DocumentKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "image" | "img" => Ok(Self::Image),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

/// A hosted document found in a patient record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReference {
    pub url: String,
    /// JSON path where the url was first seen, e.g. `reports[1].file`.
    pub field: String,
    pub inferred_kind: DocumentKind,
}

/// Decides whether a string is a hosted-document url.
pub trait ReferenceMatcher: Send + Sync {
    fn matches(&self, candidate: &str) -> bool;
}

fn parse_web_url(candidate: &str) -> Option<Url> {
    let url = Url::parse(candidate).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Matches http(s) urls whose host is one of the given domains or a
/// subdomain of one (`res.cloudinary.com` matches `cloudinary.com`).
#[derive(Debug, Clone)]
pub struct HostMatcher {
    hosts: Vec<String>,
}

impl HostMatcher {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { hosts }
    }
}

impl ReferenceMatcher for HostMatcher {
    fn matches(&self, candidate: &str) -> bool {
        let Some(url) = parse_web_url(candidate) else {
            return false;
        };
        let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
            return false;
        };
        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Matches http(s) urls against a regular expression.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: Regex,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl ReferenceMatcher for PatternMatcher {
    fn matches(&self, candidate: &str) -> bool {
        parse_web_url(candidate).is_some() && self.pattern.is_match(candidate)
    }
}

struct Pending<'a> {
    value: &'a Value,
    path: String,
    depth: usize,
    declared: Option<DocumentKind>,
}

pub struct ReferenceDiscoverer {
    matcher: Box<dyn ReferenceMatcher>,
    max_depth: usize,
}

impl ReferenceDiscoverer {
    pub fn new(matcher: Box<dyn ReferenceMatcher>) -> Self {
        Self {
            matcher,
            max_depth: DEFAULT_MAX_DISCOVERY_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Collect every matching url in `root`, in document order.
    pub fn discover(&self, root: &Value) -> Vec<DocumentReference> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut worklist = vec![Pending {
            value: root,
            path: String::new(),
            depth: 0,
            declared: None,
        }];

        while let Some(item) = worklist.pop() {
            match item.value {
                Value::Object(map) => {
                    if item.depth >= self.max_depth {
                        tracing::debug!(
                            field = %item.path,
                            "Discovery depth limit reached, skipping subtree"
                        );
                        continue;
                    }
                    let declared = declared_kind(map);
                    // Reverse push keeps pop order equal to document order.
                    for (key, child) in map.iter().rev() {
                        worklist.push(Pending {
                            value: child,
                            path: join_key(&item.path, key),
                            depth: item.depth + 1,
                            declared,
                        });
                    }
                }
                Value::Array(items) => {
                    if item.depth >= self.max_depth {
                        tracing::debug!(
                            field = %item.path,
                            "Discovery depth limit reached, skipping subtree"
                        );
                        continue;
                    }
                    for (index, child) in items.iter().enumerate().rev() {
                        worklist.push(Pending {
                            value: child,
                            path: format!("{}[{index}]", item.path),
                            depth: item.depth + 1,
                            declared: None,
                        });
                    }
                }
                Value::String(raw) => {
                    let candidate = raw.trim();
                    if !self.matcher.matches(candidate) || !seen.insert(candidate.to_string()) {
                        continue;
                    }
                    let inferred_kind = match item.declared {
                        Some(kind) => kind,
                        None => DocumentKind::from_url(candidate),
                    };
                    found.push(DocumentReference {
                        url: candidate.to_string(),
                        field: if item.path.is_empty() {
                            "$".to_string()
                        } else {
                            item.path
                        },
                        inferred_kind,
                    });
                }
                _ => {}
            }
        }

        tracing::debug!(count = found.len(), "Document references discovered");
        found
    }
}

fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn declared_kind(map: &Map<String, Value>) -> Option<DocumentKind> {
    DECLARED_TYPE_KEYS
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .map(DocumentKind::from_content_type)
        .find(|kind| *kind != DocumentKind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cloudinary() -> ReferenceDiscoverer {
        ReferenceDiscoverer::new(Box::new(HostMatcher::new(["cloudinary.com"])))
    }

    #[test]
    fn finds_urls_at_any_depth_without_duplicates() {
        let record = json!({
            "name": "A. Patient",
            "lab": { "file": "https://res.cloudinary.com/demo/raw/upload/v1/cbc.pdf" },
            "visits": [
                { "notes": "stable", "scans": [
                    "https://res.cloudinary.com/demo/image/upload/v2/xray.jpg",
                    "https://res.cloudinary.com/demo/raw/upload/v1/cbc.pdf"
                ]},
                { "deep": { "deeper": { "deepest": [[
                    "https://res.cloudinary.com/demo/image/upload/v3/ecg.png"
                ]]}}}
            ]
        });

        let refs = cloudinary().discover(&record);
        let urls: Vec<&str> = refs.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://res.cloudinary.com/demo/raw/upload/v1/cbc.pdf",
                "https://res.cloudinary.com/demo/image/upload/v2/xray.jpg",
                "https://res.cloudinary.com/demo/image/upload/v3/ecg.png",
            ]
        );
        assert_eq!(refs[0].field, "lab.file");
        assert_eq!(refs[1].field, "visits[0].scans[0]");
        assert_eq!(refs[2].field, "visits[1].deep.deeper.deepest[0][0]");
    }

    #[test]
    fn ignores_other_hosts_and_non_http_strings() {
        let record = json!({
            "a": "https://example.com/report.pdf",
            "b": "ftp://res.cloudinary.com/x.pdf",
            "c": "not a url at all cloudinary.com",
            "d": "https://evilcloudinary.com/x.pdf",
            "e": 42,
            "f": null,
            "g": true
        });
        assert!(cloudinary().discover(&record).is_empty());
    }

    #[test]
    fn infers_kind_from_suffix_and_path_markers() {
        assert_eq!(DocumentKind::from_url("https://x.cloudinary.com/a/b.PDF"), DocumentKind::Pdf);
        assert_eq!(
            DocumentKind::from_url("https://x.cloudinary.com/a/b.jpeg?version=2"),
            DocumentKind::Image
        );
        assert_eq!(
            DocumentKind::from_url("https://x.cloudinary.com/demo/image/upload/abc123"),
            DocumentKind::Image
        );
        assert_eq!(
            DocumentKind::from_url("https://x.cloudinary.com/demo/pdf/upload/abc123"),
            DocumentKind::Pdf
        );
        // Suffix wins over the storage marker.
        assert_eq!(
            DocumentKind::from_url("https://x.cloudinary.com/demo/image/upload/scan.pdf"),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::from_url("https://x.cloudinary.com/demo/raw/upload/abc123"),
            DocumentKind::Unknown
        );
    }

    #[test]
    fn declared_content_type_overrides_url() {
        let record = json!({
            "attachment": {
                "url": "https://res.cloudinary.com/demo/raw/upload/v1/blob",
                "mimeType": "application/pdf"
            },
            "photo": {
                "format": "png",
                "src": "https://res.cloudinary.com/demo/raw/upload/v1/other"
            }
        });
        let refs = cloudinary().discover(&record);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].inferred_kind, DocumentKind::Pdf);
        assert_eq!(refs[1].inferred_kind, DocumentKind::Image);
    }

    #[test]
    fn depth_limit_skips_deeper_subtrees() {
        let record = json!({
            "shallow": "https://res.cloudinary.com/a.pdf",
            "l1": { "l2": { "l3": "https://res.cloudinary.com/deep.pdf" } }
        });
        let refs = cloudinary().with_max_depth(2).discover(&record);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "https://res.cloudinary.com/a.pdf");
    }

    #[test]
    fn very_deep_nesting_does_not_overflow() {
        let mut value = json!("https://res.cloudinary.com/bottom.pdf");
        for _ in 0..5_000 {
            value = Value::Array(vec![value]);
        }
        let refs = cloudinary().with_max_depth(10_000).discover(&value);
        assert_eq!(refs.len(), 1);
        // Dropping a deeply nested Value recurses.
        std::mem::forget(value);
    }

    #[test]
    fn pattern_matcher_requires_http_and_regex_match() {
        let matcher = PatternMatcher::new(r"^https://files\.example\.org/.+").unwrap();
        assert!(matcher.matches("https://files.example.org/a.pdf"));
        assert!(!matcher.matches("https://other.example.org/a.pdf"));
        assert!(!matcher.matches("files.example.org/a.pdf"));

        let discoverer = ReferenceDiscoverer::new(Box::new(matcher));
        let refs = discoverer.discover(&json!(["https://files.example.org/a.pdf"]));
        assert_eq!(refs[0].field, "[0]");
    }

    #[test]
    fn root_string_is_a_candidate() {
        let refs = cloudinary().discover(&json!("https://res.cloudinary.com/x.png"));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].field, "$");
        assert_eq!(refs[0].inferred_kind, DocumentKind::Image);
    }

    #[test]
    fn surrounding_whitespace_is_trimmed_before_dedup() {
        let record = json!({
            "a": " https://res.cloudinary.com/x.pdf ",
            "b": "https://res.cloudinary.com/x.pdf"
        });
        assert_eq!(cloudinary().discover(&record).len(), 1);
    }

    #[test]
    fn kind_parses_from_cli_strings() {
        assert_eq!("PDF".parse::<DocumentKind>().unwrap(), DocumentKind::Pdf);
        assert_eq!("image".parse::<DocumentKind>().unwrap(), DocumentKind::Image);
        assert!("docx".parse::<DocumentKind>().is_err());
        assert_eq!(DocumentKind::from_path(Path::new("/tmp/scan.TIFF")), DocumentKind::Image);
    }
}
