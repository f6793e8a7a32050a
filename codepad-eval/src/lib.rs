//! # codepad-eval — compile, validate and run untrusted snippets
//!
//! ```text
//! validate(command, classes) ──► Toolchain::compile ──► Vec<Diagnostic>
//!
//! execute(command, classes)  ──► Toolchain::compile ──┬─► CompileError(diagnostics)
//!                                                     └─► Toolchain::run ──► Ok(output)
//!                                                                        ├─► RuntimeFault
//!                                                                        └─► SandboxViolation
//! ```
//!
//! The compiler itself is an external capability behind [`Toolchain`].
//! [`EvaluationEngine`] owns the bounds that apply to every toolchain:
//! a concurrency limit, wall-clock timeouts, an output cap and panic
//! isolation. Nothing a snippet does surfaces as anything but data.

pub mod command;
pub mod engine;
pub mod sandbox;
pub mod toolchain;

pub use command::{parse_diagnostics, CommandToolchain, ToolchainConfig};
pub use engine::{EngineConfig, EvaluationEngine};
pub use sandbox::ResourceLimits;
pub use toolchain::{Artifact, Compilation, Limits, RunOutput, Source, Toolchain, ToolchainError};
