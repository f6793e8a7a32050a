//! Compiler diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rendered in place of an empty diagnostics list.
pub const BUILD_SUCCEEDED: &str = "Build completed successfully.";

/// 1-based position in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// One compiler-reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Compiler error code, e.g. `CS1525`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            code: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(Location { line, column });
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.location {
            write!(f, "({},{}): ", loc.line, loc.column)?;
        }
        if let Some(code) = &self.code {
            write!(f, "error {code}: ")?;
        }
        f.write_str(&self.message)
    }
}

/// One line per diagnostic, or the success message when there are none.
pub fn render(diagnostics: &[Diagnostic]) -> Vec<String> {
    if diagnostics.is_empty() {
        return vec![BUILD_SUCCEEDED.to_string()];
    }
    diagnostics.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_full() {
        let d = Diagnostic::new("Invalid expression term ';'")
            .at(1, 9)
            .with_code("CS1525");
        assert_eq!(d.to_string(), "(1,9): error CS1525: Invalid expression term ';'");
    }

    #[test]
    fn test_display_bare() {
        assert_eq!(Diagnostic::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_render_empty_is_success() {
        assert_eq!(render(&[]), vec![BUILD_SUCCEEDED.to_string()]);
        assert_eq!(render(&[Diagnostic::new("a"), Diagnostic::new("b")]).len(), 2);
    }

    #[test]
    fn test_json_omits_missing_location() {
        let json = serde_json::to_string(&Diagnostic::new("x")).unwrap();
        assert_eq!(json, r#"{"message":"x"}"#);
    }
}
