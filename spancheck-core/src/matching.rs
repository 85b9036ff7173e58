//! Correlation matching and per-record field checks.
//!
//! Both stores are filtered by pipeline id at query time; whether a row
//! belongs to the current run is decided here, from the `test.run_id` tag.

use crate::models::{keys, IngestedRow, ReplicatedSpan};
use serde_json::Value;
use std::fmt;

/// Look up a dotted attribute key in a tag map.
///
/// Ingestion may keep dotted keys as-is (`{"test.run_id": ..}`) or expand
/// them into nested objects (`{"test": {"run_id": ..}}`); both are accepted.
pub fn lookup_tag<'a>(tags: &'a Value, dotted: &str) -> Option<&'a str> {
    if let Some(v) = tags.get(dotted).and_then(Value::as_str) {
        return Some(v);
    }

    let mut node = tags;
    for segment in dotted.split('.') {
        node = node.get(segment)?;
    }
    node.as_str()
}

/// Decides whether a stored record belongs to one harness run.
#[derive(Debug, Clone)]
pub struct CorrelationFilter {
    marker: String,
    name_fallback: bool,
}

impl CorrelationFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            name_fallback: false,
        }
    }

    /// Also accept spans whose name contains "test", whatever their tags say.
    pub fn with_name_fallback(mut self, enabled: bool) -> Self {
        self.name_fallback = enabled;
        self
    }

    pub fn matches_tags(&self, tags: &Value) -> bool {
        lookup_tag(tags, keys::RUN_ID) == Some(self.marker.as_str())
    }

    pub fn matches_row(&self, row: &IngestedRow) -> bool {
        match row.attributes() {
            Ok(tags) => self.matches_tags(&tags),
            Err(_) => self.mentions_marker(row.attributes.as_deref().unwrap_or_default()),
        }
    }

    pub fn matches_span(&self, span: &ReplicatedSpan) -> bool {
        let tagged = match span.attributes() {
            Ok(tags) => self.matches_tags(&tags),
            Err(_) => self.mentions_marker(&span.attributes_text()),
        };

        tagged || (self.name_fallback && span.name.to_lowercase().contains("test"))
    }

    /// Search tag text that does not parse. The marker must appear as a
    /// whole JSON string, plain or escaped, so `M1` never matches `M10`.
    fn mentions_marker(&self, text: &str) -> bool {
        let quoted = format!("\"{}\"", self.marker);
        let escaped = format!("\\\"{}\\\"", self.marker);
        text.contains(&quoted) || text.contains(&escaped)
    }
}

/// A non-fatal data-shape problem found on a matched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldWarning {
    MissingTimestamps,
    EmptyTags,
    MissingSourceSpan,
    PipelineMismatch { found: Option<String> },
    UnparsableTags { error: String },
    InvalidJson { field: &'static str, error: String },
    /// One emitted record stored as several rows.
    DuplicateRecord { trace_id: String, rows: usize },
    /// A row in the result window that could not be decoded; it was skipped.
    Undecodable { error: String },
}

impl fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldWarning::MissingTimestamps => write!(f, "missing timestamps"),
            FieldWarning::EmptyTags => write!(f, "missing attributes"),
            FieldWarning::MissingSourceSpan => write!(f, "missing source span"),
            FieldWarning::PipelineMismatch { found } => {
                write!(f, "pipeline id mismatch: {}", found.as_deref().unwrap_or("<none>"))
            }
            FieldWarning::UnparsableTags { error } => write!(f, "invalid attributes JSON: {error}"),
            FieldWarning::InvalidJson { field, error } => write!(f, "invalid {field} JSON: {error}"),
            FieldWarning::DuplicateRecord { trace_id, rows } => {
                write!(f, "trace {trace_id} stored as {rows} rows")
            }
            FieldWarning::Undecodable { error } => write!(f, "undecodable row skipped: {error}"),
        }
    }
}

pub fn check_row(row: &IngestedRow, expected_pipeline: &str) -> Vec<FieldWarning> {
    let mut warnings = Vec::new();

    if row.start_time.is_none() || row.end_time.is_none() {
        warnings.push(FieldWarning::MissingTimestamps);
    }

    match row.attributes() {
        Ok(Value::Null) => warnings.push(FieldWarning::EmptyTags),
        Ok(Value::Object(map)) if map.is_empty() => warnings.push(FieldWarning::EmptyTags),
        Ok(_) => {}
        Err(e) => warnings.push(FieldWarning::UnparsableTags { error: e.to_string() }),
    }

    match row.source_span() {
        Ok(Value::Null) => warnings.push(FieldWarning::MissingSourceSpan),
        Ok(_) => {}
        Err(e) => warnings.push(FieldWarning::InvalidJson {
            field: "sourceOtelSpan",
            error: e.to_string(),
        }),
    }

    if row.pipeline_id.as_deref() != Some(expected_pipeline) {
        warnings.push(FieldWarning::PipelineMismatch {
            found: row.pipeline_id.clone(),
        });
    }

    warnings
}

pub fn check_span(span: &ReplicatedSpan) -> Vec<FieldWarning> {
    let mut warnings = Vec::new();

    if let Err(e) = span.attributes() {
        warnings.push(FieldWarning::UnparsableTags { error: e.to_string() });
    }

    for (field, payload) in [
        ("functionArgs", &span.function_args),
        ("functionOutput", &span.function_output),
    ] {
        let Some(text) = payload.as_deref().filter(|t| !t.is_empty()) else {
            continue;
        };
        if let Err(e) = serde_json::from_str::<Value>(text) {
            warnings.push(FieldWarning::InvalidJson {
                field,
                error: e.to_string(),
            });
        }
    }

    warnings
}
