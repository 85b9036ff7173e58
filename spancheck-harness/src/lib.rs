pub mod harness;
pub mod report;
pub mod stages;

pub use harness::{Backends, Harness};
pub use report::{RunReport, Stage, StageReport, StageStatus};
