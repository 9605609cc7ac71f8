//! Execution pipeline: one request from workspace acquisition to release
//!
//! ```text
//! Pending -> WorkspaceAcquired -> [Compiling] -> Running -> Completed
//!    |              |                  |            |
//!    +--------------+------------------+------------+-----> Failed
//! ```
//!
//! A program that fails to build still produces an `ExecutionResult` (with
//! `phase = compile`); only infrastructure problems surface as errors.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compiler::{self, CompileLimits, CompileOutcome};
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::languages::{TemplateContext, ToolchainRegistry, ToolchainSpec};
use crate::protocol::base64_bytes;
use crate::runner::{CommandSpec, RunLimits, RunOutcome, Runner};
use crate::workspace::{Workspace, WorkspaceManager};

/// Per-request overrides of the run step's base limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub time_limit_ms: Option<u32>,
    pub memory_limit_mb: Option<u32>,
}

/// A request to build and run one program
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub language: String,
    pub source: Vec<u8>,
    pub stdin: Option<Vec<u8>>,
    pub limits: LimitOverrides,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            language: language.into(),
            source: source.into(),
            stdin: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Phase the request reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

/// Outcome of one request, produced once and never modified
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub phase: Phase,
    /// -1 when the process was killed or did not exit normally
    pub exit_code: i32,
    pub signal: Option<i32>,
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_kb: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub truncated: bool,
}

impl ExecutionResult {
    fn from_outcome(request_id: Uuid, phase: Phase, outcome: RunOutcome) -> Self {
        Self {
            request_id,
            phase,
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            wall_time_ms: outcome.wall_time_ms,
            cpu_time_ms: outcome.cpu_time_ms,
            memory_kb: outcome.memory_kb,
            timed_out: outcome.timed_out,
            memory_exceeded: outcome.memory_exceeded,
            truncated: outcome.truncated,
        }
    }

    /// Compiler output is reported on stderr; the program never ran
    fn compile_failure(request_id: Uuid, outcome: RunOutcome) -> Self {
        let stderr = compiler::diagnostics(&outcome);
        Self {
            stdout: Vec::new(),
            stderr,
            ..Self::from_outcome(request_id, Phase::Compile, outcome)
        }
    }
}

/// Lifecycle of a single pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    WorkspaceAcquired,
    Compiling,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Pending, WorkspaceAcquired)
                | (WorkspaceAcquired, Compiling)
                | (WorkspaceAcquired, Running)
                | (Compiling, Running)
                | (Running, Completed)
                | (Pending | WorkspaceAcquired | Compiling | Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

struct StateTracker {
    request_id: Uuid,
    state: PipelineState,
}

impl StateTracker {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            state: PipelineState::Pending,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "Request {}: invalid transition {:?} -> {:?}",
                self.request_id, self.state, next
            );
            debug_assert!(false, "invalid pipeline transition");
        }
        debug!("Request {}: {:?} -> {:?}", self.request_id, self.state, next);
        self.state = next;
    }
}

/// Limits applied by the pipeline when neither request nor toolchain set one
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub default_time_limit_ms: u32,
    pub default_memory_limit_mb: u32,
    pub max_output_bytes: usize,
    pub compile: CompileLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for PipelineConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            default_time_limit_ms: config.default_time_limit_ms,
            default_memory_limit_mb: config.default_memory_limit_mb,
            max_output_bytes: config.max_output_bytes,
            compile: CompileLimits {
                time_limit_ms: config.compile_time_limit_ms,
                memory_limit_mb: config.compile_memory_limit_mb,
                max_output_bytes: config.max_output_bytes,
            },
        }
    }
}

/// Orchestrates registry lookup, workspace, compile and run for each request
pub struct Pipeline {
    registry: Arc<ToolchainRegistry>,
    workspaces: WorkspaceManager,
    runner: Arc<dyn Runner>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ToolchainRegistry>,
        workspaces: WorkspaceManager,
        runner: Arc<dyn Runner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            workspaces,
            runner,
            config,
        }
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Execute one request end to end
    ///
    /// The workspace is released before this returns, on every path.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ExecutionResult> {
        let mut state = StateTracker::new(request.request_id);

        let toolchain = match self.registry.resolve(&request.language) {
            Ok(toolchain) => toolchain,
            Err(e) => {
                state.advance(PipelineState::Failed);
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            state.advance(PipelineState::Failed);
            return Err(RunnerError::Cancelled);
        }

        let workspace = match self.workspaces.acquire(request.request_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                state.advance(PipelineState::Failed);
                return Err(e);
            }
        };
        state.advance(PipelineState::WorkspaceAcquired);

        let result = self
            .execute_in(&mut state, toolchain, &workspace, request, cancel)
            .await;

        if let Err(e) = workspace.release().await {
            warn!(
                "Failed to release workspace for request {}: {}",
                request.request_id, e
            );
        }
        if result.is_err() && !state.state.is_terminal() {
            state.advance(PipelineState::Failed);
        }
        result
    }

    async fn execute_in(
        &self,
        state: &mut StateTracker,
        toolchain: &ToolchainSpec,
        workspace: &Workspace,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ExecutionResult> {
        workspace
            .write_source(&toolchain.source_file, &request.source)
            .await?;

        if toolchain.is_compiled() {
            state.advance(PipelineState::Compiling);
            let outcome = compiler::compile(
                self.runner.as_ref(),
                toolchain,
                workspace.path(),
                &self.config.compile,
                cancel,
            )
            .await?;

            match outcome {
                CompileOutcome::Failed(outcome) => {
                    state.advance(PipelineState::Failed);
                    return Ok(ExecutionResult::compile_failure(request.request_id, outcome));
                }
                CompileOutcome::Succeeded { steps } => debug!(
                    "Request {}: {} compile step(s) succeeded",
                    request.request_id, steps
                ),
                CompileOutcome::Skipped => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        state.advance(PipelineState::Running);

        let run_step = toolchain.run_step();
        let base_time_ms = request
            .limits
            .time_limit_ms
            .or(run_step.time_limit_ms)
            .unwrap_or(self.config.default_time_limit_ms);
        let base_memory_mb = request
            .limits
            .memory_limit_mb
            .or(run_step.memory_limit_mb)
            .unwrap_or(self.config.default_memory_limit_mb);
        let time_limit_ms = toolchain.calculate_time_limit(base_time_ms);
        let memory_limit_mb = toolchain.calculate_memory_limit(base_memory_mb);

        let command = run_step.render(&TemplateContext {
            source_file: &toolchain.source_file,
            workspace: workspace.path(),
            memory_mb: memory_limit_mb,
        });
        let cmd = CommandSpec::from_vec(&command)
            .with_env(toolchain.env.iter().cloned())
            .with_work_dir(workspace.path());
        let limits = RunLimits::for_time(time_limit_ms, memory_limit_mb, self.config.max_output_bytes);

        let outcome = self
            .runner
            .run(&cmd, &limits, request.stdin.as_deref(), cancel)
            .await?;
        if outcome.cancelled {
            return Err(RunnerError::Cancelled);
        }

        state.advance(PipelineState::Completed);
        Ok(ExecutionResult::from_outcome(
            request.request_id,
            Phase::Run,
            outcome,
        ))
    }
}
