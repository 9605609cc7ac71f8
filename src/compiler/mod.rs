//! Compiler module - Source code compilation
//!
//! Runs a toolchain's compile steps in order inside the request's workspace.
//! The first failing step ends the phase; its outcome is what the caller
//! reports back.

use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};
use crate::languages::{TemplateContext, ToolchainSpec};
use crate::runner::{CommandSpec, RunLimits, RunOutcome, RunStatus, Runner};

/// Defaults for compile steps that set no limits of their own
#[derive(Debug, Clone, Copy)]
pub struct CompileLimits {
    /// Time limit in milliseconds (default: 30000ms = 30s)
    pub time_limit_ms: u32,
    /// Memory limit in MB (default: 2048MB)
    pub memory_limit_mb: u32,
    pub max_output_bytes: usize,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            time_limit_ms: 30_000,
            memory_limit_mb: 2048,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Result of the compile phase
#[derive(Debug)]
pub enum CompileOutcome {
    /// Interpreted language, nothing to compile
    Skipped,
    /// Every step exited with code 0
    Succeeded { steps: usize },
    /// The step that failed; later steps were not started
    Failed(RunOutcome),
}

/// Compile user-submitted code in `workspace`
pub async fn compile(
    runner: &dyn Runner,
    toolchain: &ToolchainSpec,
    workspace: &Path,
    defaults: &CompileLimits,
    cancel: &CancellationToken,
) -> RunnerResult<CompileOutcome> {
    let steps = toolchain.compile_steps();
    if steps.is_empty() {
        return Ok(CompileOutcome::Skipped);
    }

    for (idx, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let time_limit_ms = step.time_limit_ms.unwrap_or(defaults.time_limit_ms);
        let memory_limit_mb = step.memory_limit_mb.unwrap_or(defaults.memory_limit_mb);
        let command = step.render(&TemplateContext {
            source_file: &toolchain.source_file,
            workspace,
            memory_mb: memory_limit_mb,
        });

        debug!(
            "Compiling {} (step {}/{}): {:?}",
            toolchain.language,
            idx + 1,
            steps.len(),
            command
        );

        let cmd = CommandSpec::from_vec(&command)
            .with_env(toolchain.env.iter().cloned())
            .with_work_dir(workspace);
        let limits = RunLimits::for_time(time_limit_ms, memory_limit_mb, defaults.max_output_bytes);
        let outcome = runner.run(&cmd, &limits, None, cancel).await?;

        if outcome.cancelled {
            return Err(RunnerError::Cancelled);
        }
        if !outcome.is_success() {
            debug!(
                "Compile step {} of {} failed: {:?}",
                idx + 1,
                toolchain.language,
                outcome.status
            );
            return Ok(CompileOutcome::Failed(outcome));
        }
    }

    Ok(CompileOutcome::Succeeded { steps: steps.len() })
}

/// Diagnostics for a failed compile step: stderr, then stdout, or a
/// description of the failure when the compiler printed nothing
pub fn diagnostics(outcome: &RunOutcome) -> Vec<u8> {
    let mut message = outcome.stderr.clone();
    message.extend_from_slice(&outcome.stdout);
    if !message.is_empty() {
        return message;
    }

    let description = match outcome.status {
        RunStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
        RunStatus::MemoryLimitExceeded => "Compiler exceeded the memory limit".to_string(),
        RunStatus::Signaled(_) => "Compiler crashed".to_string(),
        RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
        _ => "Compilation failed".to_string(),
    };
    description.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::ToolchainRegistry;
    use crate::runner::ProcessRunner;

    const TOOLCHAINS: &str = r#"
[shell]
source_file = "main.sh"
compile_commands = ["sh -n {source}", "cp {source} prog.sh"]
run_command = "sh prog.sh"

[broken]
source_file = "main.sh"
compile_commands = ["sh -c false", "touch second-step-ran"]
run_command = "sh prog.sh"

[interpreted]
source_file = "main.sh"
run_command = "sh {source}"
"#;

    async fn compile_in(language: &str, source: &[u8]) -> (tempfile::TempDir, CompileOutcome) {
        let registry = ToolchainRegistry::from_toml_str(TOOLCHAINS).unwrap();
        let toolchain = registry.resolve(language).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(&toolchain.source_file), source).unwrap();

        let outcome = compile(
            &ProcessRunner::default(),
            toolchain,
            dir.path(),
            &CompileLimits::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        (dir, outcome)
    }

    #[tokio::test]
    async fn test_compile_steps_run_in_order() {
        let (dir, outcome) = compile_in("shell", b"echo hi\n").await;

        assert!(matches!(outcome, CompileOutcome::Succeeded { steps: 2 }));
        assert!(dir.path().join("prog.sh").exists());
    }

    #[tokio::test]
    async fn test_failed_step_stops_phase() {
        let (dir, outcome) = compile_in("broken", b"echo hi\n").await;

        match outcome {
            CompileOutcome::Failed(run) => assert_eq!(run.exit_code, 1),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!dir.path().join("second-step-ran").exists());
    }

    #[tokio::test]
    async fn test_syntax_error_reports_diagnostics() {
        let (_dir, outcome) = compile_in("shell", b"if then fi (\n").await;

        let CompileOutcome::Failed(run) = outcome else {
            panic!("expected failure");
        };
        assert_ne!(run.exit_code, 0);
        assert!(!diagnostics(&run).is_empty());
    }

    #[tokio::test]
    async fn test_interpreted_language_skips() {
        let (_dir, outcome) = compile_in("interpreted", b"echo hi\n").await;
        assert!(matches!(outcome, CompileOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_cancelled_before_compile() {
        let registry = ToolchainRegistry::from_toml_str(TOOLCHAINS).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = compile(
            &ProcessRunner::default(),
            registry.resolve("shell").unwrap(),
            dir.path(),
            &CompileLimits::default(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(RunnerError::Cancelled)));
    }

    #[test]
    fn test_diagnostics_fallback() {
        let outcome = RunOutcome {
            status: RunStatus::TimeLimitExceeded,
            exit_code: -1,
            signal: Some(9),
            stdout: Vec::new(),
            stderr: Vec::new(),
            wall_time_ms: 61_000,
            cpu_time_ms: 30_001,
            memory_kb: 0,
            timed_out: true,
            memory_exceeded: false,
            truncated: false,
            cancelled: false,
        };
        assert_eq!(diagnostics(&outcome), b"Compilation timed out");

        let with_output = RunOutcome {
            stderr: b"error: ".to_vec(),
            stdout: b"main.c:1".to_vec(),
            ..outcome
        };
        assert_eq!(diagnostics(&with_output), b"error: main.c:1");
    }
}
