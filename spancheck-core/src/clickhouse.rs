use crate::config::ClickHouseConfig;
use crate::error::StoreError;
use crate::store::{ColumnStore, ColumnStoreConnector, SpanBatch, RECENT_LIMIT};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Escape a string value for use inside a ClickHouse single-quoted literal.
fn escape_ch_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quote_ch_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('\\', "\\\\").replace('`', "\\`"))
}

pub fn recent_spans_sql(table: &str, pipeline_id: &str) -> String {
    format!(
        "SELECT \
             ifNull(toString(id), '') AS id, \
             ifNull(toString(name), '') AS name, \
             functionArgs, \
             functionOutput, \
             toString(startTime) AS startTime, \
             toString(endTime) AS endTime, \
             attributesMap, \
             toString(traceId) AS traceId, \
             pipelineId \
         FROM {} \
         WHERE pipelineId = '{}' \
         ORDER BY createdAt DESC \
         LIMIT {} \
         FORMAT JSONEachRow",
        quote_ch_ident(table),
        escape_ch_string(pipeline_id),
        RECENT_LIMIT,
    )
}

/// Parse a `JSONEachRow` body, one span per non-empty line.
///
/// A line that does not decode is skipped and described in the batch; the
/// rest of the window is still returned.
pub fn parse_json_each_row(body: &str) -> SpanBatch {
    let mut batch = SpanBatch::default();
    for (index, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(span) => batch.spans.push(span),
            Err(e) => {
                tracing::debug!(line = index + 1, error = %e, "Skipping undecodable ClickHouse row");
                batch.skipped.push(format!("line {}: {e}", index + 1));
            }
        }
    }
    batch
}

/// Column store reached through the ClickHouse HTTP interface.
#[derive(Debug, Clone)]
pub struct ClickHouseHttpStore {
    http: Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
    table: String,
}

impl ClickHouseHttpStore {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            table: config.table.clone(),
        })
    }

    /// `GET /ping`; ClickHouse answers `Ok.` when up.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let resp = self.http.get(format!("{}/ping", self.base_url)).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(StoreError::Query {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn exec(&self, sql: &str) -> Result<String, StoreError> {
        let resp = self
            .http
            .post(&self.base_url)
            .query(&[("database", self.database.as_str())])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_owned())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            Ok(body)
        } else {
            tracing::error!(status = status.as_u16(), body = %body.trim(), "ClickHouse query failed");
            Err(StoreError::Query {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ColumnStore for ClickHouseHttpStore {
    async fn recent_spans(
        &mut self,
        pipeline_id: &str,
    ) -> Result<SpanBatch, StoreError> {
        let body = self.exec(&recent_spans_sql(&self.table, pipeline_id)).await?;
        Ok(parse_json_each_row(&body))
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Hands out stores sharing one HTTP client.
pub struct ClickHouseConnector {
    store: ClickHouseHttpStore,
}

impl ClickHouseConnector {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, StoreError> {
        Ok(Self {
            store: ClickHouseHttpStore::new(config)?,
        })
    }
}

#[async_trait]
impl ColumnStoreConnector for ClickHouseConnector {
    async fn connect(&self) -> Result<Box<dyn ColumnStore>, StoreError> {
        let store = self.store.clone();
        store.ping().await?;
        tracing::debug!(url = %store.base_url, "Connected to ClickHouse");
        Ok(Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ClickHouseConfig {
        let addr = server.address();
        ClickHouseConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: "secret".to_string(),
            table: "GTSpan".to_string(),
            tls: false,
        }
    }

    #[test]
    fn test_sql_escapes_pipeline_literal() {
        let sql = recent_spans_sql("GTSpan", "x' OR '1'='1");

        assert!(sql.contains("FROM `GTSpan`"));
        assert!(sql.contains(r"WHERE pipelineId = 'x\' OR \'1\'=\'1'"));
        assert!(sql.contains("ifNull(toString(name), '') AS name"));
        assert!(sql.ends_with("FORMAT JSONEachRow"));
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let body = "{\"id\":\"a\",\"name\":\"n\"}\n\n{\"id\":\"b\",\"name\":\"m\"}\n";
        let batch = parse_json_each_row(body);
        assert_eq!(batch.spans.len(), 2);
        assert_eq!(batch.spans[1].id, "b");
        assert!(batch.skipped.is_empty());
    }

    #[test]
    fn test_undecodable_lines_are_skipped_not_fatal() {
        let body = concat!(
            "{\"id\":\"s1\",\"name\":\"test-interaction\",\"attributesMap\":\"{}\"}\n",
            "{\"id\":\"s9\",\"name\":null,\"attributesMap\":\"{}\"}\n",
            "not json\n",
        );
        let batch = parse_json_each_row(body);

        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.spans[0].id, "s1");
        assert_eq!(batch.skipped.len(), 2);
        assert!(batch.skipped[0].starts_with("line 2:"), "{:?}", batch.skipped);
        assert!(batch.skipped[1].starts_with("line 3:"));
    }

    #[tokio::test]
    async fn test_connect_pings_and_query_sends_credentials() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok.\n"))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(query_param("database", "default"))
            .and(header("X-ClickHouse-User", "default"))
            .and(header("X-ClickHouse-Key", "secret"))
            .and(body_string_contains("WHERE pipelineId = 'pipe'"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"id\":\"s1\",\"name\":\"test-interaction\",\"functionArgs\":\"[]\",\"attributesMap\":\"{}\"}\n",
            ))
            .mount(&mock_server)
            .await;

        let connector = ClickHouseConnector::new(&config_for(&mock_server)).unwrap();
        let mut store = connector.connect().await.expect("connect should succeed");
        let batch = store.recent_spans("pipe").await.expect("query should succeed");

        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.spans[0].name, "test-interaction");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_error_surfaces_status_and_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string("Code: 60. DB::Exception: Table default.GTSpan does not exist"),
            )
            .mount(&mock_server)
            .await;

        let mut store = ClickHouseHttpStore::new(&config_for(&mock_server)).unwrap();
        match store.recent_spans("pipe").await {
            Err(StoreError::Query { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("does not exist"));
            }
            other => panic!("Expected Query error, got {:?}", other.map(|b| b.spans.len())),
        }
    }
}
