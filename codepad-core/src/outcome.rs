//! Execution outcomes.
//!
//! Every failure of compiling or running a snippet is a [`Fault`] value,
//! never an error that escapes to the serving process.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::diagnostic::Diagnostic;

/// A bound of the sandbox that the executed code crossed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxViolation {
    Timeout { limit_ms: u64 },
    OutputLimit { limit_bytes: usize },
    ResourceLimit { detail: String },
}

impl fmt::Display for SandboxViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { limit_ms } => write!(f, "Execution timed out after {limit_ms} ms"),
            Self::OutputLimit { limit_bytes } => {
                write!(f, "Output exceeded the limit of {limit_bytes} bytes")
            }
            Self::ResourceLimit { detail } => write!(f, "Resource limit exceeded: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum Fault {
    /// Compilation failed; carries the same diagnostics `validate` reports.
    CompileError { diagnostics: Vec<Diagnostic> },
    /// The program itself failed.
    RuntimeFault {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    SandboxViolation { violation: SandboxViolation },
}

impl Fault {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeFault {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn diagnostics(&self) -> Option<&[Diagnostic]> {
        match self {
            Self::CompileError { diagnostics } => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<SandboxViolation> for Fault {
    fn from(violation: SandboxViolation) -> Self {
        Self::SandboxViolation { violation }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompileError { diagnostics } => {
                f.write_str("Compilation failed")?;
                for d in diagnostics {
                    write!(f, "\n{d}")?;
                }
                Ok(())
            }
            Self::RuntimeFault { message, exit_code: Some(code) } => {
                write!(f, "Runtime error (exit code {code}): {message}")
            }
            Self::RuntimeFault { message, exit_code: None } => write!(f, "Runtime error: {message}"),
            Self::SandboxViolation { violation } => violation.fmt(f),
        }
    }
}

/// Result of `execute`: the program's output, or a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Ok { output: String },
    Fault(Fault),
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(f) => Some(f),
            Self::Ok { .. } => None,
        }
    }

    pub fn is_compile_error(&self) -> bool {
        matches!(self, Self::Fault(Fault::CompileError { .. }))
    }
}

impl From<Fault> for ExecutionResult {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_lists_diagnostics() {
        let fault = Fault::CompileError {
            diagnostics: vec![Diagnostic::new("first").at(1, 1), Diagnostic::new("second")],
        };
        assert_eq!(fault.to_string(), "Compilation failed\n(1,1): first\nsecond");
    }

    #[test]
    fn test_sandbox_display() {
        let fault: Fault = SandboxViolation::Timeout { limit_ms: 250 }.into();
        assert_eq!(fault.to_string(), "Execution timed out after 250 ms");
    }

    #[test]
    fn test_result_json_shape() {
        let ok = ExecutionResult::Ok { output: "2".into() };
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"status":"ok","output":"2"}"#);

        let fault = ExecutionResult::Fault(Fault::runtime("boom"));
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["status"], "fault");
        assert_eq!(json["fault"], "runtime_fault");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_result_predicates() {
        let ce = ExecutionResult::from(Fault::CompileError { diagnostics: vec![] });
        assert!(ce.is_compile_error());
        assert!(!ce.is_ok());
        assert!(ExecutionResult::Ok { output: String::new() }.fault().is_none());
    }
}
