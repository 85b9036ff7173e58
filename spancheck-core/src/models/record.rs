use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attribute keys understood by the ingestion service.
pub mod keys {
    pub const PIPELINE_ID: &str = "gentrace.pipeline_id";
    pub const SAMPLE: &str = "gentrace.sample";
    pub const SPAN_TYPE: &str = "gentrace.type";
    pub const TEST_TYPE: &str = "test.type";
    pub const TEST_FRAMEWORK: &str = "test.framework";
    pub const RUN_ID: &str = "test.run_id";
    pub const FUNCTION_NAME: &str = "function.name";
    pub const FUNCTION_ARGS: &str = "function.args";
    pub const FUNCTION_OUTPUT: &str = "function.output";
    pub const LLM_PROVIDER: &str = "llm.provider";
    pub const LLM_MODEL: &str = "llm.model";
    pub const LLM_MESSAGES: &str = "llm.messages";
    pub const LLM_CHOICES: &str = "llm.choices";
}

pub const FRAMEWORK: &str = "spancheck";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Simple,
    Llm,
    Error,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Simple, RecordKind::Llm, RecordKind::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Simple => "simple",
            RecordKind::Llm => "llm",
            RecordKind::Error => "error",
        }
    }

    /// Span name used on the wire.
    pub fn span_name(&self) -> &'static str {
        match self {
            RecordKind::Simple => "test-interaction",
            RecordKind::Llm => "test-llm-call",
            RecordKind::Error => "test-exception",
        }
    }

    /// Value of `gentrace.type`.
    pub fn span_type(&self) -> &'static str {
        match self {
            RecordKind::Simple => "interaction",
            RecordKind::Llm => "llm",
            RecordKind::Error => "function",
        }
    }
}

/// One synthetic span handed to the ingestion endpoint.
///
/// Built once by the emitter and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticRecord {
    pub trace_id: String,
    pub span_id: String,
    pub kind: RecordKind,
    pub tags: BTreeMap<String, String>,
    pub input: Option<String>,
    pub output: Option<String>,
    /// Status message when the operation failed.
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SyntheticRecord {
    /// A record with fresh ids and the tags every record carries.
    pub fn new(
        kind: RecordKind,
        pipeline_id: &str,
        marker: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let tags = BTreeMap::from([
            (keys::PIPELINE_ID.to_string(), pipeline_id.to_string()),
            (keys::SAMPLE.to_string(), "true".to_string()),
            (keys::SPAN_TYPE.to_string(), kind.span_type().to_string()),
            (keys::TEST_TYPE.to_string(), kind.as_str().to_string()),
            (keys::TEST_FRAMEWORK.to_string(), FRAMEWORK.to_string()),
            (keys::RUN_ID.to_string(), marker.to_string()),
        ]);

        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            kind,
            tags,
            input: None,
            output: None,
            error: None,
            start_time,
            end_time,
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    /// Serialized input, also exposed as `function.args`.
    pub fn with_input(mut self, input: &serde_json::Value) -> Self {
        let text = input.to_string();
        self.tags.insert(keys::FUNCTION_ARGS.to_string(), text.clone());
        self.input = Some(text);
        self
    }

    /// Serialized output, also exposed as `function.output`.
    pub fn with_output(mut self, output: &serde_json::Value) -> Self {
        let text = output.to_string();
        self.tags.insert(keys::FUNCTION_OUTPUT.to_string(), text.clone());
        self.output = Some(text);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.span_name()
    }
}

/// 16 random bytes as 32 lowercase hex chars.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 8 random bytes as 16 lowercase hex chars.
pub fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
