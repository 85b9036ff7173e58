//! OTLP/HTTP emission for synthetic records
//!
//! Provides a `SpanSink` trait ("send one record, flush everything") with one
//! implementation, `OtlpHttpExporter`, which posts OTLP/JSON
//! `ExportTraceServiceRequest` bodies to the ingestion endpoint:
//! - **batch** mode buffers records and posts them together on `flush`
//! - **simple** mode posts each record as soon as it is sent

use crate::config::{EndpointConfig, ExportMode};
use crate::models::SyntheticRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const SCOPE_NAME: &str = "spancheck";

// ============================================================================
// SpanSink trait
// ============================================================================

/// Where the emitter hands its records.
#[async_trait]
pub trait SpanSink: Send + Sync {
    /// Accept one record. May export immediately or buffer it.
    async fn send(&self, record: &SyntheticRecord) -> Result<(), EmitError>;

    /// Export everything buffered, failing if that takes longer than `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), EmitError>;

    /// Flush and refuse further records.
    async fn shutdown(&self, timeout: Duration) -> Result<(), EmitError>;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint rejected export ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Flush did not complete within {timeout_ms} ms")]
    FlushTimeout { timeout_ms: u64 },

    #[error("Exporter already shut down")]
    ShutDown,

    #[error("Missing API key")]
    MissingApiKey,
}

// ============================================================================
// OTLP/JSON wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceServiceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct Resource {
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<Span>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: String,
    version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Span {
    trace_id: String,
    span_id: String,
    name: String,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<Event>,
    status: Status,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    time_unix_nano: String,
    name: String,
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct Status {
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnyValue {
    string_value: String,
}

const SPAN_KIND_INTERNAL: u8 = 1;
const STATUS_CODE_OK: u8 = 1;
const STATUS_CODE_ERROR: u8 = 2;

fn kv(key: &str, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: AnyValue {
            string_value: value.into(),
        },
    }
}

fn unix_nanos(t: DateTime<Utc>) -> String {
    t.timestamp_nanos_opt().unwrap_or_default().to_string()
}

fn encode_span(record: &SyntheticRecord) -> Span {
    let attributes = record.tags.iter().map(|(k, v)| kv(k, v.as_str())).collect();

    let (status, events) = match &record.error {
        Some(message) => (
            Status {
                code: STATUS_CODE_ERROR,
                message: Some(message.clone()),
            },
            vec![Event {
                time_unix_nano: unix_nanos(record.end_time),
                name: "exception".to_string(),
                attributes: vec![
                    kv("exception.type", "Error"),
                    kv("exception.message", message.as_str()),
                ],
            }],
        ),
        None => (
            Status {
                code: STATUS_CODE_OK,
                message: None,
            },
            Vec::new(),
        ),
    };

    Span {
        trace_id: record.trace_id.clone(),
        span_id: record.span_id.clone(),
        name: record.name().to_string(),
        kind: SPAN_KIND_INTERNAL,
        start_time_unix_nano: unix_nanos(record.start_time),
        end_time_unix_nano: unix_nanos(record.end_time),
        attributes,
        events,
        status,
    }
}

/// Build the OTLP/JSON body for `records` under one resource and scope.
pub fn encode_request(service_name: &str, records: &[SyntheticRecord]) -> serde_json::Value {
    let request = ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![
                    kv("service.name", service_name),
                    kv("service.version", env!("CARGO_PKG_VERSION")),
                ],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope {
                    name: SCOPE_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                spans: records.iter().map(encode_span).collect(),
            }],
        }],
    };

    serde_json::to_value(request).unwrap_or(serde_json::Value::Null)
}

// ============================================================================
// OtlpHttpExporter
// ============================================================================

#[derive(Debug, Default)]
struct ExporterState {
    buffer: Vec<SyntheticRecord>,
    shut_down: bool,
}

/// OTLP/HTTP client for the ingestion endpoint.
#[derive(Debug)]
pub struct OtlpHttpExporter {
    client: Client,
    traces_url: String,
    api_key: String,
    service_name: String,
    mode: ExportMode,
    state: Mutex<ExporterState>,
}

impl OtlpHttpExporter {
    pub fn new(config: &EndpointConfig, service_name: &str) -> Result<Self, EmitError> {
        if config.api_key.is_empty() {
            return Err(EmitError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            traces_url: config.traces_url(),
            api_key: config.api_key.clone(),
            service_name: service_name.to_string(),
            mode: config.export_mode,
            state: Mutex::new(ExporterState::default()),
        })
    }

    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExporterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn export(&self, records: &[SyntheticRecord]) -> Result<(), EmitError> {
        if records.is_empty() {
            return Ok(());
        }

        let body = encode_request(&self.service_name, records);
        let response = self
            .client
            .post(&self.traces_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "OTLP export rejected");
            return Err(EmitError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(spans = records.len(), "OTLP export accepted");
        Ok(())
    }
}

#[async_trait]
impl SpanSink for OtlpHttpExporter {
    async fn send(&self, record: &SyntheticRecord) -> Result<(), EmitError> {
        {
            let mut state = self.lock();
            if state.shut_down {
                return Err(EmitError::ShutDown);
            }
            if self.mode == ExportMode::Batch {
                state.buffer.push(record.clone());
                return Ok(());
            }
        }

        self.export(std::slice::from_ref(record)).await
    }

    async fn flush(&self, timeout: Duration) -> Result<(), EmitError> {
        let batch = std::mem::take(&mut self.lock().buffer);

        match tokio::time::timeout(timeout, self.export(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(EmitError::FlushTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), EmitError> {
        let result = self.flush(timeout).await;
        self.lock().shut_down = true;
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{keys, RecordKind};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(base_url: &str, mode: ExportMode) -> EndpointConfig {
        EndpointConfig {
            base_url: format!("{base_url}/api"),
            api_key: "test-api-key".to_string(),
            export_mode: mode,
            request_timeout_seconds: 5,
        }
    }

    fn record(kind: RecordKind) -> SyntheticRecord {
        let start = Utc::now();
        SyntheticRecord::new(kind, "pipe", "run-1", start, start + chrono::Duration::milliseconds(100))
    }

    #[test]
    fn test_encode_request_shape() {
        let ok = record(RecordKind::Simple);
        let failed = record(RecordKind::Error).with_error("Value must be non-negative");
        let body = encode_request("svc", &[ok.clone(), failed]);

        let scope = &body["resourceSpans"][0]["scopeSpans"][0];
        assert_eq!(
            body["resourceSpans"][0]["resource"]["attributes"][0],
            serde_json::json!({"key": "service.name", "value": {"stringValue": "svc"}})
        );
        assert_eq!(scope["scope"]["name"], SCOPE_NAME);

        let first = &scope["spans"][0];
        assert_eq!(first["traceId"], ok.trace_id.as_str());
        assert_eq!(first["name"], "test-interaction");
        assert_eq!(first["status"]["code"], STATUS_CODE_OK);
        assert!(first.get("events").is_none());
        assert!(first["attributes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a["key"] == keys::RUN_ID && a["value"]["stringValue"] == "run-1"));

        let start: i64 = first["startTimeUnixNano"].as_str().unwrap().parse().unwrap();
        let end: i64 = first["endTimeUnixNano"].as_str().unwrap().parse().unwrap();
        assert_eq!(end - start, 100_000_000);

        let second = &scope["spans"][1];
        assert_eq!(second["status"]["code"], STATUS_CODE_ERROR);
        assert_eq!(second["status"]["message"], "Value must be non-negative");
        assert_eq!(second["events"][0]["name"], "exception");
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let mut config = endpoint("http://localhost:1", ExportMode::Batch);
        config.api_key.clear();

        assert!(matches!(
            OtlpHttpExporter::new(&config, "svc"),
            Err(EmitError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_batch_mode_posts_once_on_flush_with_bearer_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/otel/v1/traces"))
            .and(header("authorization", "Bearer test-api-key"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let exporter =
            OtlpHttpExporter::new(&endpoint(&mock_server.uri(), ExportMode::Batch), "svc").unwrap();
        for kind in RecordKind::ALL {
            exporter.send(&record(kind)).await.unwrap();
        }
        assert!(mock_server.received_requests().await.unwrap().is_empty());

        exporter.flush(Duration::from_secs(5)).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body["resourceSpans"][0]["scopeSpans"][0]["spans"]
                .as_array()
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_simple_mode_posts_per_record() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&mock_server)
            .await;

        let exporter =
            OtlpHttpExporter::new(&endpoint(&mock_server.uri(), ExportMode::Simple), "svc").unwrap();
        exporter.send(&record(RecordKind::Simple)).await.unwrap();
        exporter.send(&record(RecordKind::Llm)).await.unwrap();
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);

        // nothing buffered, so no extra request
        exporter.flush(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_times_out_on_slow_endpoint() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let exporter =
            OtlpHttpExporter::new(&endpoint(&mock_server.uri(), ExportMode::Batch), "svc").unwrap();
        exporter.send(&record(RecordKind::Simple)).await.unwrap();

        let result = exporter.flush(Duration::from_millis(200)).await;
        match result {
            Err(EmitError::FlushTimeout { timeout_ms }) => assert_eq!(timeout_ms, 200),
            other => panic!("Expected FlushTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_export_surfaces_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&mock_server)
            .await;

        let exporter =
            OtlpHttpExporter::new(&endpoint(&mock_server.uri(), ExportMode::Batch), "svc").unwrap();
        exporter.send(&record(RecordKind::Simple)).await.unwrap();

        match exporter.flush(Duration::from_secs(5)).await {
            Err(EmitError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid api key");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let mock_server = MockServer::start().await;
        let exporter =
            OtlpHttpExporter::new(&endpoint(&mock_server.uri(), ExportMode::Batch), "svc").unwrap();

        exporter.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(matches!(
            exporter.send(&record(RecordKind::Simple)).await,
            Err(EmitError::ShutDown)
        ));
    }
}
