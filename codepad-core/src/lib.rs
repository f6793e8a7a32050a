//! # codepad-core — shared model types
//!
//! Everything the store, the evaluation engine and the live channel agree on:
//!
//! - [`post`] — slugs, saved posts and unsaved drafts
//! - [`diagnostic`] — compiler-reported problems
//! - [`outcome`] — execution results and structured faults

pub mod diagnostic;
pub mod outcome;
pub mod post;

pub use diagnostic::{render as render_diagnostics, Diagnostic, Location, BUILD_SUCCEEDED};
pub use outcome::{ExecutionResult, Fault, SandboxViolation};
pub use post::{canonical_path, not_found_message, Draft, Post, Slug, SlugError};

/// Seconds since the Unix epoch, saturating to 0 on a skewed clock.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
