//! Evaluation engine: bounded validate/execute over a [`Toolchain`].
//!
//! Every toolchain call runs in its own task so that a panic or a hang
//! inside it is contained. A concurrency permit is held for the whole
//! call and released on every exit path.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

use codepad_core::{Diagnostic, ExecutionResult, Fault, SandboxViolation};

use crate::command::{CommandToolchain, ToolchainConfig};
use crate::toolchain::{Artifact, Limits, RunOutput, Source, Toolchain, ToolchainError};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on one compile, in milliseconds
    pub compile_timeout_ms: u64,
    /// Upper bound on one run, in milliseconds
    pub run_timeout_ms: u64,
    /// Cap on each of stdout/stderr of a run
    pub max_output_bytes: usize,
    /// Evaluations allowed in flight at once
    pub max_concurrent: usize,
    pub toolchain: ToolchainConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compile_timeout_ms: 15_000,
            run_timeout_ms: 5_000,
            max_output_bytes: 64 * 1024,
            max_concurrent: num_cpus(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Short bounds, single permit.
    pub fn for_testing() -> Self {
        Self {
            compile_timeout_ms: 2_000,
            run_timeout_ms: 500,
            max_output_bytes: 4 * 1024,
            max_concurrent: 1,
            toolchain: ToolchainConfig::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            timeout: Duration::from_millis(self.run_timeout_ms),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub validations: u64,
    pub executions: u64,
    pub compile_errors: u64,
    pub runtime_faults: u64,
    pub sandbox_violations: u64,
}

#[derive(Default)]
struct Counters {
    validations: AtomicU64,
    executions: AtomicU64,
    compile_errors: AtomicU64,
    runtime_faults: AtomicU64,
    sandbox_violations: AtomicU64,
}

/// Validates and executes snippets under the configured bounds.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct EvaluationEngine {
    toolchain: Arc<dyn Toolchain>,
    permits: Arc<Semaphore>,
    compile_timeout: Duration,
    limits: Limits,
    counters: Counters,
}

impl EvaluationEngine {
    pub fn new(toolchain: Arc<dyn Toolchain>, config: &EngineConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        log::info!(
            "Evaluation engine: {} concurrent, compile {} ms, run {} ms, output {} bytes",
            max_concurrent,
            config.compile_timeout_ms,
            config.run_timeout_ms,
            config.max_output_bytes
        );
        Self {
            toolchain,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            compile_timeout: Duration::from_millis(config.compile_timeout_ms),
            limits: config.limits(),
            counters: Counters::default(),
        }
    }

    /// Engine over a [`CommandToolchain`] built from `config.toolchain`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ToolchainError> {
        let toolchain = CommandToolchain::new(config.toolchain.clone())?;
        Ok(Self::new(Arc::new(toolchain), config))
    }

    /// Compile only; the snippet is never run.
    ///
    /// Empty means the code compiles. Deterministic for identical input.
    pub async fn validate(&self, command: &str, classes: &str) -> Vec<Diagnostic> {
        self.counters.validations.fetch_add(1, Ordering::Relaxed);
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return vec![Diagnostic::new("evaluation engine is shut down")];
        };

        match self.compile(Source::new(command, classes)).await {
            Ok(_artifact) => Vec::new(),
            Err(diagnostics) => diagnostics,
        }
    }

    /// Compile, then run under the sandbox bounds.
    pub async fn execute(&self, command: &str, classes: &str) -> ExecutionResult {
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return Fault::runtime("evaluation engine is shut down").into();
        };

        let result = match self.compile(Source::new(command, classes)).await {
            Ok(artifact) => self.run(artifact).await,
            Err(diagnostics) => Fault::CompileError { diagnostics }.into(),
        };

        self.record(&result);
        log::debug!(
            "Executed snippet in {:?}: {}",
            started.elapsed(),
            match &result {
                ExecutionResult::Ok { .. } => "ok",
                ExecutionResult::Fault(Fault::CompileError { .. }) => "compile error",
                ExecutionResult::Fault(Fault::RuntimeFault { .. }) => "runtime fault",
                ExecutionResult::Fault(Fault::SandboxViolation { .. }) => "sandbox violation",
            }
        );
        result
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            validations: self.counters.validations.load(Ordering::Relaxed),
            executions: self.counters.executions.load(Ordering::Relaxed),
            compile_errors: self.counters.compile_errors.load(Ordering::Relaxed),
            runtime_faults: self.counters.runtime_faults.load(Ordering::Relaxed),
            sandbox_violations: self.counters.sandbox_violations.load(Ordering::Relaxed),
        }
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    // ─── Steps ───────────────────────────────────────────────

    async fn compile(&self, source: Source) -> Result<Artifact, Vec<Diagnostic>> {
        let toolchain = self.toolchain.clone();
        let mut task = TaskGuard(tokio::spawn(async move { toolchain.compile(&source).await }));

        let joined = match tokio::time::timeout(self.compile_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.0.abort();
                let _ = task.await;
                log::warn!("Compilation timed out after {:?}", self.compile_timeout);
                return Err(vec![Diagnostic::new(format!(
                    "Compilation timed out after {} ms",
                    self.compile_timeout.as_millis()
                ))]);
            }
        };

        match joined {
            Err(e) => Err(vec![Diagnostic::new(describe_join_error("compiler", &e))]),
            Ok(Err(ToolchainError::Violation(violation))) => {
                Err(vec![Diagnostic::new(violation.to_string())])
            }
            Ok(Err(e)) => {
                log::error!("Toolchain failed to compile: {e}");
                Err(vec![Diagnostic::new(e.to_string())])
            }
            Ok(Ok(compilation)) => match (compilation.diagnostics.is_empty(), compilation.artifact) {
                (false, _) => Err(compilation.diagnostics),
                (true, Some(artifact)) => Ok(artifact),
                (true, None) => Err(vec![Diagnostic::new("compilation produced no artifact")]),
            },
        }
    }

    async fn run(&self, artifact: Artifact) -> ExecutionResult {
        let limits = self.limits;
        let toolchain = self.toolchain.clone();
        let mut task = TaskGuard(tokio::spawn(async move { toolchain.run(artifact, limits).await }));

        // Grace over the toolchain's own deadline so its answer wins when it has one.
        let deadline = limits.timeout + Duration::from_millis(50);
        let joined = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.0.abort();
                let _ = task.await;
                log::warn!("Run exceeded {:?}; cancelled", limits.timeout);
                return Fault::from(SandboxViolation::Timeout {
                    limit_ms: limits.timeout.as_millis() as u64,
                })
                .into();
            }
        };

        match joined {
            Err(e) => Fault::runtime(describe_join_error("runner", &e)).into(),
            Ok(Err(ToolchainError::Violation(violation))) => Fault::from(violation).into(),
            Ok(Err(e)) => {
                log::error!("Toolchain failed to run artifact: {e}");
                Fault::runtime(e.to_string()).into()
            }
            Ok(Ok(output)) => self.classify(output),
        }
    }

    fn classify(&self, output: RunOutput) -> ExecutionResult {
        let cap = self.limits.max_output_bytes;
        if output.stdout.len() > cap || output.stderr.len() > cap {
            return Fault::from(SandboxViolation::OutputLimit { limit_bytes: cap }).into();
        }
        if output.success() {
            return ExecutionResult::Ok {
                output: output.stdout,
            };
        }

        let stderr = output.stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else {
            match output.exit_code {
                Some(code) => format!("Process exited with status {code}"),
                None => "Process was terminated by a signal".to_string(),
            }
        };
        Fault::RuntimeFault {
            message,
            exit_code: output.exit_code,
        }
        .into()
    }

    fn record(&self, result: &ExecutionResult) {
        let counter = match result {
            ExecutionResult::Ok { .. } => return,
            ExecutionResult::Fault(Fault::CompileError { .. }) => &self.counters.compile_errors,
            ExecutionResult::Fault(Fault::RuntimeFault { .. }) => &self.counters.runtime_faults,
            ExecutionResult::Fault(Fault::SandboxViolation { .. }) => {
                &self.counters.sandbox_violations
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Join handle that aborts its task when dropped.
///
/// Dropping an in-flight `validate`/`execute` future therefore stops the
/// toolchain call too, and with it any child process.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Future for TaskGuard<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn describe_join_error(stage: &str, e: &JoinError) -> String {
    if e.is_panic() {
        log::error!("Toolchain {stage} panicked");
        format!("internal error: {stage} crashed")
    } else {
        format!("internal error: {stage} was cancelled")
    }
}
