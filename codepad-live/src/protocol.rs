//! Wire protocol for the live channel and the validate endpoint.
//!
//! Client → server:
//! ```text
//! {"type":"execute","content":"return 1;","classes":"","id":7}
//! {"type":"validate","command":"int x = ;","classes":"","seq":3}
//! {"type":"ping"}
//! ```
//! Server → client:
//! ```text
//! {"type":"execution","status":"ok","result":"2","id":7}
//! {"type":"execution","status":"fault","result":"Execution timed out after 5000 ms","fault":{..}}
//! {"type":"validation","seq":3,"status":"ok","diagnostics":[..]}
//! {"type":"pong"}
//! {"type":"error","message":"..."}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use codepad_core::{Diagnostic, ExecutionResult, Fault};

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Success/fault discriminator shared by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Fault,
}

/// Frames an editor sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Execute {
        content: String,
        #[serde(default)]
        classes: String,
        /// Echoed back on the matching result when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Validate {
        command: String,
        #[serde(default)]
        classes: String,
        seq: u64,
    },
    Ping,
}

/// Frames the service pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Execution {
        status: Status,
        /// Program output, or the rendered fault
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fault: Option<Fault>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Validation {
        seq: u64,
        status: Status,
        diagnostics: Vec<Diagnostic>,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ClientFrame {
    pub fn execute(content: impl Into<String>, classes: impl Into<String>) -> Self {
        Self::Execute {
            content: content.into(),
            classes: classes.into(),
            id: None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

impl ServerFrame {
    /// Push frame for an execution outcome.
    pub fn execution(result: &ExecutionResult, id: Option<u64>) -> Self {
        match result {
            ExecutionResult::Ok { output } => Self::Execution {
                status: Status::Ok,
                result: output.clone(),
                fault: None,
                id,
            },
            ExecutionResult::Fault(fault) => Self::Execution {
                status: Status::Fault,
                result: fault.to_string(),
                fault: Some(fault.clone()),
                id,
            },
        }
    }

    /// The execution outcome carried by an `execution` frame.
    pub fn execution_result(&self) -> Option<ExecutionResult> {
        let Self::Execution {
            status,
            result,
            fault,
            ..
        } = self
        else {
            return None;
        };
        Some(match (status, fault) {
            (Status::Ok, _) => ExecutionResult::Ok {
                output: result.clone(),
            },
            (Status::Fault, Some(fault)) => fault.clone().into(),
            (Status::Fault, None) => Fault::runtime(result.clone()).into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Body of `POST /validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateRequest {
    pub command: String,
    pub classes: String,
}

/// Reply to `POST /validate`; `diagnostics` is empty when the code compiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub status: Status,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidateResponse {
    pub fn ok(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            status: Status::Ok,
            diagnostics,
        }
    }
}
