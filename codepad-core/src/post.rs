//! Posts: immutable, versioned snapshots of a snippet and its classes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Path segments that address fixed routes and can never be slugs.
const RESERVED: &[&str] = &["save", "validate", "import", "latest", "live"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("slug must not be empty")]
    Empty,
    #[error("slug is longer than {max} characters")]
    TooLong { max: usize },
    #[error("slug contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("slug '{0}' is reserved")]
    Reserved(String),
}

/// Stable, human-readable identifier shared by every version of a document.
///
/// Slugs are 1..=64 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    pub const MAX_LEN: usize = 64;

    /// Length of generated slugs.
    const GENERATED_LEN: usize = 8;

    pub fn parse(raw: impl Into<String>) -> Result<Self, SlugError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SlugError::Empty);
        }
        if raw.len() > Self::MAX_LEN {
            return Err(SlugError::TooLong { max: Self::MAX_LEN });
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(SlugError::InvalidChar(c));
        }
        if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(&raw)) {
            return Err(SlugError::Reserved(raw));
        }
        Ok(Self(raw))
    }

    /// Random lowercase alphanumeric slug. Callers check for collisions.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(id[..Self::GENERATED_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A stored, immutable version of a document.
///
/// `(slug, version)` is unique; once written a post is never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub slug: Slug,
    /// Starts at 1, strictly increasing per slug
    pub version: u64,
    /// The executable command/snippet
    pub content: String,
    /// Supporting type definitions compiled alongside `content`
    pub classes: String,
    /// Seconds since epoch at save time
    pub created_at: u64,
}

impl Post {
    /// Canonical address: `/<slug>` for version 1, `/<slug>/<version>` after.
    pub fn path(&self) -> String {
        canonical_path(&self.slug, self.version)
    }
}

/// Address of `(slug, version)` with version 1 collapsed to the bare slug.
pub fn canonical_path(slug: &Slug, version: u64) -> String {
    if version > 1 {
        format!("/{slug}/{version}")
    } else {
        format!("/{slug}")
    }
}

/// Message shown when `(slug, version)` does not exist.
pub fn not_found_message(slug: &str, version: u64) -> String {
    format!("code snippet of '{slug}' ver. {version} was not found.")
}

/// Unsaved editor contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub classes: String,
}

impl Draft {
    pub fn new(content: impl Into<String>, classes: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            classes: classes.into(),
        }
    }

    /// Draft seeded only with classes (import-from-URL).
    pub fn with_classes(classes: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            classes: classes.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_accepts_valid() {
        for raw in ["greet", "a", "hello-world_2", "ABC123"] {
            assert_eq!(Slug::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn test_slug_rejects_invalid() {
        assert_eq!(Slug::parse(""), Err(SlugError::Empty));
        assert_eq!(Slug::parse("a b"), Err(SlugError::InvalidChar(' ')));
        assert_eq!(Slug::parse("a/b"), Err(SlugError::InvalidChar('/')));
        assert_eq!(Slug::parse("x\0"), Err(SlugError::InvalidChar('\0')));
        assert!(matches!(Slug::parse("a".repeat(65)), Err(SlugError::TooLong { .. })));
        assert!(matches!(Slug::parse("Latest"), Err(SlugError::Reserved(_))));
        assert!(matches!(Slug::parse("validate"), Err(SlugError::Reserved(_))));
        assert!(matches!(Slug::parse("save"), Err(SlugError::Reserved(_))));
        assert!(matches!(Slug::parse("SAVE"), Err(SlugError::Reserved(_))));
    }

    #[test]
    fn test_generated_slug_is_valid() {
        for _ in 0..100 {
            let slug = Slug::generate();
            assert_eq!(slug.as_str().len(), 8);
            assert!(Slug::parse(slug.as_str()).is_ok());
        }
    }

    #[test]
    fn test_slug_serde_validates() {
        let ok: Slug = serde_json::from_str("\"greet\"").unwrap();
        assert_eq!(ok.as_str(), "greet");
        assert!(serde_json::from_str::<Slug>("\"no spaces\"").is_err());
    }

    #[test]
    fn test_canonical_path() {
        let slug = Slug::parse("greet").unwrap();
        assert_eq!(canonical_path(&slug, 1), "/greet");
        assert_eq!(canonical_path(&slug, 0), "/greet");
        assert_eq!(canonical_path(&slug, 7), "/greet/7");
    }

    #[test]
    fn test_draft_defaults_missing_fields() {
        let draft: Draft = serde_json::from_str("{\"content\":\"x\"}").unwrap();
        assert_eq!(draft, Draft::new("x", ""));
    }
}
