use serde::Deserialize;
use serde_json::Value;

/// A span as replicated into the column store, one `JSONEachRow` line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub function_args: Option<String>,
    #[serde(default)]
    pub function_output: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    /// Either a JSON object or the JSON text of one, depending on column type.
    #[serde(default)]
    pub attributes_map: Value,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<String>,
}

impl ReplicatedSpan {
    /// The attribute map as structured JSON.
    pub fn attributes(&self) -> Result<Value, serde_json::Error> {
        match &self.attributes_map {
            Value::String(text) if text.trim().is_empty() => Ok(Value::Null),
            Value::String(text) => serde_json::from_str(text),
            other => Ok(other.clone()),
        }
    }

    /// The attribute map as text, for substring matching when it does not parse.
    pub fn attributes_text(&self) -> String {
        match &self.attributes_map {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_json_each_row_line_with_string_attributes() {
        let line = r#"{"id":"abc","name":"test-llm-call","functionArgs":"[1]","functionOutput":"","startTime":"2025-01-01 00:00:00.000","endTime":"2025-01-01 00:00:00.100","attributesMap":"{\"test\":{\"run_id\":\"m\"}}","traceId":"t","pipelineId":null}"#;
        let span: ReplicatedSpan = serde_json::from_str(line).unwrap();

        assert_eq!(span.name, "test-llm-call");
        assert_eq!(span.function_args.as_deref(), Some("[1]"));
        assert_eq!(span.pipeline_id, None);
        assert_eq!(span.attributes().unwrap(), json!({"test": {"run_id": "m"}}));
    }

    #[test]
    fn test_object_attributes_pass_through() {
        let span: ReplicatedSpan = serde_json::from_value(json!({
            "id": "abc",
            "name": "n",
            "attributesMap": {"test.run_id": "m"}
        }))
        .unwrap();

        assert_eq!(span.attributes().unwrap(), json!({"test.run_id": "m"}));
        assert!(span.attributes_text().contains("\"m\""));
    }

    #[test]
    fn test_malformed_attribute_text_is_an_error() {
        let span: ReplicatedSpan = serde_json::from_value(json!({
            "id": "abc",
            "name": "n",
            "attributesMap": "{not json"
        }))
        .unwrap();

        assert!(span.attributes().is_err());
        assert_eq!(span.attributes_text(), "{not json");
    }
}
