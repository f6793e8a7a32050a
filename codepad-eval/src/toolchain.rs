//! The compiler capability: `compile(source) → diagnostics | artifact`,
//! `run(artifact) → output | error`.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

use codepad_core::{Diagnostic, SandboxViolation};

/// What the user submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub command: String,
    pub classes: String,
}

impl Source {
    pub fn new(command: impl Into<String>, classes: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            classes: classes.into(),
        }
    }
}

/// A compiled program, ready to run once.
///
/// Owns the work directory it was built in; dropping the artifact removes
/// it, so every exit path of a run releases the directory.
#[derive(Debug)]
pub struct Artifact {
    source: Source,
    workdir: Option<TempDir>,
}

impl Artifact {
    /// Artifact living inside `workdir`.
    pub fn in_workdir(workdir: TempDir, source: Source) -> Self {
        Self {
            source,
            workdir: Some(workdir),
        }
    }

    /// Artifact with no on-disk state (interpreted toolchains).
    pub fn detached(source: Source) -> Self {
        Self {
            source,
            workdir: None,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }
}

/// Outcome of a compile step.
///
/// `artifact` is present exactly when `diagnostics` is empty.
#[derive(Debug)]
pub struct Compilation {
    pub diagnostics: Vec<Diagnostic>,
    pub artifact: Option<Artifact>,
}

impl Compilation {
    pub fn success(artifact: Artifact) -> Self {
        Self {
            diagnostics: Vec::new(),
            artifact: Some(artifact),
        }
    }

    pub fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            diagnostics,
            artifact: None,
        }
    }
}

/// Captured result of running an artifact to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Bounds a toolchain should apply itself where it can.
///
/// The engine enforces the same bounds from outside regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("toolchain command is empty")]
    EmptyCommand,
    #[error("toolchain has no sandbox wrapper and allow_unsandboxed is not set")]
    Unsandboxed,
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("toolchain I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Violation(SandboxViolation),
}

/// External, language-specific compiler and runner.
#[async_trait]
pub trait Toolchain: Send + Sync + 'static {
    /// Compile without executing anything the user wrote.
    async fn compile(&self, source: &Source) -> Result<Compilation, ToolchainError>;

    /// Run a compiled artifact. Dropping the returned future must stop the run.
    async fn run(&self, artifact: Artifact, limits: Limits) -> Result<RunOutput, ToolchainError>;
}
