//! Pre-build checks: lint, eval and test, gated into a clear-to-build verdict.

pub mod gate;
pub mod pipeline;
pub mod runner;
pub mod stage;

pub use gate::{CheckGate, GateVerdict};
pub use pipeline::{CheckOptions, CheckPipeline, CheckReport};
pub use runner::{StageResult, StageRunner};
pub use stage::{CheckOutcome, CheckResult, CheckStage, StageCommand};
