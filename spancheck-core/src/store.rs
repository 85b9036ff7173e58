//! Read-only access to the two downstream stores.
//!
//! A connector opens one handle per stage; the stage closes it when done.
//! Neither store is pooled.

use crate::error::StoreError;
use crate::models::{IngestedRow, ReplicatedSpan};
use async_trait::async_trait;

/// Maximum rows fetched per poll.
pub const RECENT_LIMIT: u32 = 50;

/// One read of the column store. Lines that did not decode are left out of
/// `spans` and described in `skipped`.
#[derive(Debug, Default)]
pub struct SpanBatch {
    pub spans: Vec<ReplicatedSpan>,
    pub skipped: Vec<String>,
}

impl From<Vec<ReplicatedSpan>> for SpanBatch {
    fn from(spans: Vec<ReplicatedSpan>) -> Self {
        Self {
            spans,
            skipped: Vec::new(),
        }
    }
}

#[async_trait]
pub trait RowStore: Send {
    /// Newest rows for `pipeline_id`, most recent first.
    async fn recent_rows(&mut self, pipeline_id: &str) -> Result<Vec<IngestedRow>, StoreError>;

    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RowStoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RowStore>, StoreError>;
}

#[async_trait]
pub trait ColumnStore: Send {
    /// Newest replicated spans for `pipeline_id`, most recent first.
    async fn recent_spans(&mut self, pipeline_id: &str) -> Result<SpanBatch, StoreError>;

    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ColumnStoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ColumnStore>, StoreError>;
}
