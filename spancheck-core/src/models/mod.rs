pub mod record;
pub mod row;
pub mod span;

pub use record::{keys, RecordKind, SyntheticRecord};
pub use row::IngestedRow;
pub use span::ReplicatedSpan;
