pub mod clickhouse;
pub mod config;
pub mod db;
pub mod error;
pub mod matching;
pub mod models;
pub mod otlp;
pub mod poll;
pub mod store;

pub use config::HarnessConfig;
pub use error::{SpancheckError, StoreError};
pub use matching::{CorrelationFilter, FieldWarning};
pub use otlp::{EmitError, OtlpHttpExporter, SpanSink};
pub use poll::{bounded, Bounded, Clock, ManualClock, PollOutcome, Poller, Probe, Progress, SystemClock};
