//! Multi-language code execution runner
//!
//! A request (language, source, optional stdin) passes the admission gate,
//! gets a private workspace, is compiled and run under time, memory and output
//! limits, and comes back as an [`ExecutionResult`]. The workspace and every
//! process the request started are gone by the time the result is returned.

pub mod compiler;
pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod languages;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod worker;
pub mod workspace;

pub use config::{AdmissionPolicy, RunnerConfig};
pub use error::{RunnerError, RunnerResult};
pub use gate::{AdmissionGate, ExecutionService};
pub use languages::{ToolchainRegistry, ToolchainSpec};
pub use pipeline::{ExecutionRequest, ExecutionResult, LimitOverrides, Phase, Pipeline};
pub use runner::{ProcessRunner, Runner};
pub use workspace::{Workspace, WorkspaceManager};
