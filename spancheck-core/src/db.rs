use crate::config::PostgresConfig;
use crate::error::StoreError;
use crate::models::IngestedRow;
use crate::store::{RowStore, RowStoreConnector, RECENT_LIMIT};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;

pub fn connect_options(config: &PostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password)
}

pub async fn connect(config: &PostgresConfig) -> Result<PgConnection, sqlx::Error> {
    PgConnection::connect_with(&connect_options(config)).await
}

pub async fn health_check(conn: &mut PgConnection) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(conn).await?;
    Ok(row.0)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Newest spans of one pipeline. Casts normalise column types so the
/// query decodes the same whether timestamps carry a zone and whether the
/// JSON columns are `json`, `jsonb` or text. JSON stays text here; a
/// malformed value is a per-row warning, never a failed query.
pub fn recent_rows_sql(table: &str) -> String {
    format!(
        r#"
        SELECT
            COALESCE(id::text, '') AS id,
            COALESCE("traceId"::text, '') AS trace_id,
            COALESCE(name::text, '') AS name,
            type::text AS span_type,
            "startTime"::timestamptz AS start_time,
            "endTime"::timestamptz AS end_time,
            "attributesMap"::text AS attributes,
            "sourceOtelSpan"::text AS source_span,
            "pipelineId"::text AS pipeline_id
        FROM {}
        WHERE "pipelineId"::text = $1
        ORDER BY "createdAt" DESC
        LIMIT {}
        "#,
        quote_ident(table),
        RECENT_LIMIT
    )
}

/// Row store backed by a single Postgres connection.
pub struct PgRowStore {
    conn: PgConnection,
    sql: String,
}

impl PgRowStore {
    pub fn new(conn: PgConnection, table: &str) -> Self {
        Self {
            conn,
            sql: recent_rows_sql(table),
        }
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn recent_rows(&mut self, pipeline_id: &str) -> Result<Vec<IngestedRow>, StoreError> {
        let rows: Vec<IngestedRow> = sqlx::query_as(&self.sql)
            .bind(pipeline_id)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

pub struct PgRowStoreConnector {
    config: PostgresConfig,
}

impl PgRowStoreConnector {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RowStoreConnector for PgRowStoreConnector {
    async fn connect(&self) -> Result<Box<dyn RowStore>, StoreError> {
        let mut conn = connect(&self.config).await?;
        let version = health_check(&mut conn).await?;
        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            version = %version,
            "Connected to Postgres"
        );
        Ok(Box::new(PgRowStore::new(conn, &self.config.table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_rows_sql_quotes_table_and_filters_by_pipeline() {
        let sql = recent_rows_sql("GTSpan");

        assert!(sql.contains(r#"FROM "GTSpan""#));
        assert!(sql.contains(r#"WHERE "pipelineId"::text = $1"#));
        assert!(sql.contains(r#"ORDER BY "createdAt" DESC"#));
        assert!(sql.contains("LIMIT 50"));
        assert!(sql.contains(r#""attributesMap"::text AS attributes"#));
        assert!(!sql.contains("jsonb"));
    }

    #[test]
    fn test_quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    // Requires a running Postgres with the ingestion schema.
    #[tokio::test]
    #[ignore]
    async fn test_connector_reads_recent_rows() {
        let connector = PgRowStoreConnector::new(PostgresConfig::default());
        let mut store = connector.connect().await.expect("Failed to connect to Postgres");

        let rows = store
            .recent_rows("c10408c7-abde-5c19-b339-e8b1087c9b64")
            .await
            .expect("query should succeed");
        assert!(rows.len() <= RECENT_LIMIT as usize);

        store.close().await.expect("close should succeed");
    }
}
