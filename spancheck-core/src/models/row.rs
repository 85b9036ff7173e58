use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A span as the row store keeps it after ingestion.
///
/// JSON columns come back as text and are parsed on demand, so one bad
/// value never fails the query that fetched it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestedRow {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub span_type: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Option<String>,
    /// Raw OTLP span as received.
    pub source_span: Option<String>,
    pub pipeline_id: Option<String>,
}

impl IngestedRow {
    /// The tag map as structured JSON; absent or blank text is `Null`.
    pub fn attributes(&self) -> Result<Value, serde_json::Error> {
        parse_json_text(self.attributes.as_deref())
    }

    pub fn source_span(&self) -> Result<Value, serde_json::Error> {
        parse_json_text(self.source_span.as_deref())
    }
}

fn parse_json_text(text: Option<&str>) -> Result<Value, serde_json::Error> {
    match text.map(str::trim) {
        None | Some("") => Ok(Value::Null),
        Some(text) => serde_json::from_str(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(attributes: Option<&str>) -> IngestedRow {
        IngestedRow {
            id: "1".to_string(),
            trace_id: "t".to_string(),
            name: "n".to_string(),
            span_type: None,
            start_time: None,
            end_time: None,
            attributes: attributes.map(str::to_string),
            source_span: None,
            pipeline_id: None,
        }
    }

    #[test]
    fn test_attributes_parse_from_text() {
        assert_eq!(
            row(Some(r#"{"test.run_id":"M1"}"#)).attributes().unwrap(),
            json!({"test.run_id": "M1"})
        );
        assert_eq!(row(None).attributes().unwrap(), Value::Null);
        assert_eq!(row(Some("  ")).attributes().unwrap(), Value::Null);
        assert!(row(Some("{broken")).attributes().is_err());
    }
}
