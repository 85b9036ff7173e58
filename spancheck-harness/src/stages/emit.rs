//! Emit stage: the three synthetic records of a run.

use super::short_id;
use crate::report::{Stage, StageReport};
use chrono::{DateTime, Utc};
use serde_json::json;
use spancheck_core::models::{keys, RecordKind, SyntheticRecord};
use spancheck_core::otlp::{EmitError, SpanSink};
use std::time::{Duration, Instant};

const SIMPLE_PROMPT: &str = "Hello from spancheck!";
const LLM_PROMPT: &str = "Generate a haiku about testing";

/// The fixed record set: a pass-through call, a simulated model call and a
/// call that fails. Every record carries `marker`.
pub fn build_test_records(
    pipeline_id: &str,
    marker: &str,
    now: DateTime<Utc>,
) -> Vec<SyntheticRecord> {
    let work = chrono::Duration::milliseconds(100);

    let simple = SyntheticRecord::new(RecordKind::Simple, pipeline_id, marker, now, now + work)
        .with_tag(keys::FUNCTION_NAME, "test_function")
        .with_input(&json!([SIMPLE_PROMPT]))
        .with_output(&json!({ "result": format!("Processed: {SIMPLE_PROMPT}") }));

    let messages = json!([{ "role": "user", "content": LLM_PROMPT }]);
    let choices = json!([{
        "message": {
            "role": "assistant",
            "content": format!("This is a test response to: {LLM_PROMPT}")
        }
    }]);
    let llm = SyntheticRecord::new(RecordKind::Llm, pipeline_id, marker, now, now + work)
        .with_tag(keys::FUNCTION_NAME, "test_llm_call")
        .with_tag(keys::LLM_PROVIDER, "openai")
        .with_tag(keys::LLM_MODEL, "gpt-4")
        .with_tag(keys::LLM_MESSAGES, messages.to_string())
        .with_tag(keys::LLM_CHOICES, choices.to_string())
        .with_input(&json!({ "prompt": LLM_PROMPT, "temperature": 0.5 }))
        .with_output(&json!({
            "model": "gpt-4",
            "response": format!("This is a test response to: {LLM_PROMPT}"),
            "tokens": LLM_PROMPT.split(' ').count(),
        }));

    let error = SyntheticRecord::new(
        RecordKind::Error,
        pipeline_id,
        marker,
        now,
        now + chrono::Duration::milliseconds(1),
    )
    .with_tag(keys::FUNCTION_NAME, "test_function_with_error")
    .with_input(&json!([-5]))
    .with_error("Value must be non-negative");

    vec![simple, llm, error]
}

/// Send the record set through `sink` and flush it.
///
/// Returns the trace ids in emission order. No retries: the first transport
/// error, or a flush that outlives `flush_timeout`, is returned as-is.
pub async fn emit_test_records(
    sink: &dyn SpanSink,
    pipeline_id: &str,
    marker: &str,
    flush_timeout: Duration,
) -> Result<Vec<String>, EmitError> {
    let records = build_test_records(pipeline_id, marker, Utc::now());
    let mut trace_ids = Vec::with_capacity(records.len());

    for record in &records {
        sink.send(record).await?;
        tracing::info!(
            name = record.name(),
            kind = record.kind.as_str(),
            trace_id = short_id(&record.trace_id),
            "Sent test span"
        );
        trace_ids.push(record.trace_id.clone());
    }

    sink.flush(flush_timeout).await?;
    Ok(trace_ids)
}

/// Emit stage wrapper: converts errors into a failed report.
pub async fn run(
    sink: &dyn SpanSink,
    pipeline_id: &str,
    marker: &str,
    flush_timeout: Duration,
) -> (StageReport, Vec<String>) {
    tracing::info!(marker, "Sending test OpenTelemetry traces");
    let started = Instant::now();

    match emit_test_records(sink, pipeline_id, marker, flush_timeout).await {
        Ok(trace_ids) => {
            tracing::info!(count = trace_ids.len(), "Sent test traces");
            let report = StageReport::passed(Stage::Emit, format!("{} traces sent", trace_ids.len()))
                .with_elapsed(started.elapsed());
            (report, trace_ids)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to send test traces");
            let report = StageReport::failed(Stage::Emit, e.to_string()).with_elapsed(started.elapsed());
            (report, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builds_three_distinct_tagged_records() {
        let records = build_test_records("pipe", "M1", Utc::now());

        assert_eq!(records.len(), 3);
        let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, RecordKind::ALL.to_vec());

        let trace_ids: HashSet<_> = records.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(trace_ids.len(), 3);

        for r in &records {
            assert_eq!(r.tags[keys::RUN_ID], "M1");
            assert_eq!(r.tags[keys::TEST_FRAMEWORK], "spancheck");
            assert_eq!(r.tags[keys::PIPELINE_ID], "pipe");
            assert!(r.end_time >= r.start_time);
        }
    }

    #[test]
    fn test_payloads_are_valid_json_and_only_error_record_fails() {
        let records = build_test_records("pipe", "M1", Utc::now());

        for r in &records {
            for text in r.input.iter().chain(r.output.iter()) {
                serde_json::from_str::<serde_json::Value>(text).expect("payload should be JSON");
            }
        }
        assert!(records[0].error.is_none());
        assert!(records[1].error.is_none());
        assert_eq!(records[2].error.as_deref(), Some("Value must be non-negative"));
        assert!(records[1].tags.contains_key(keys::LLM_MESSAGES));
    }
}
