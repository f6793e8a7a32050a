//! # codepad-store — append-only, versioned post storage
//!
//! ```text
//! save(slug, content, classes)
//!        │
//!        ▼
//! ┌──────────────┐   per-slug lock   ┌──────────────────────────────────┐
//! │ SlugLocks    │ ────────────────► │ read latest → latest + 1         │
//! └──────────────┘                   │ write post + latest in one batch │
//!                                    └──────────────────────────────────┘
//! ```
//!
//! Versions are allocated under a lock scoped to one slug, so saves to
//! different slugs run in parallel. A post and the `latest` pointer that
//! makes it visible are committed together; readers never see a version
//! that is not fully written.
//!
//! Two backends implement [`ContentStore`]:
//!
//! - [`RocksStore`] — RocksDB, LZ4-compressed records
//! - [`MemoryStore`] — process memory, for tests and ephemeral servers

mod locks;
pub mod memory;
pub mod rocks;

use codepad_core::{not_found_message, Post, Slug};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Attempts at finding an unused generated slug before giving up.
const GENERATE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("{}", not_found_message(slug.as_str(), *version))]
    NotFound { slug: Slug, version: u64 },
    /// Versions start at 1; rejected before touching the backend
    #[error("invalid version {0}: versions start at 1")]
    InvalidVersion(u64),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("no unused slug found after {0} attempts")]
    SlugExhausted(usize),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only post storage keyed by `(slug, version)`.
///
/// Implementations must allocate versions atomically per slug and must
/// never overwrite or delete a stored version.
pub trait ContentStore: Send + Sync {
    /// Store a new version of `slug`.
    ///
    /// With `only_if_new` set, returns `Ok(None)` instead of writing when
    /// the slug already has versions.
    fn append(
        &self,
        slug: &Slug,
        content: &str,
        classes: &str,
        only_if_new: bool,
    ) -> Result<Option<Post>, StoreError>;

    /// Fetch one version. `version == 0` is rejected with `InvalidVersion`.
    fn get(&self, slug: &Slug, version: u64) -> Result<Post, StoreError>;

    /// Highest stored version, or 0 when the slug does not exist.
    fn latest_version(&self, slug: &Slug) -> Result<u64, StoreError>;

    /// Every stored version of `slug`, ascending.
    fn versions(&self, slug: &Slug) -> Result<Vec<u64>, StoreError>;

    /// Save `slug`: version 1 if new, `latest + 1` otherwise.
    fn save(&self, slug: &Slug, content: &str, classes: &str) -> Result<Post, StoreError> {
        match self.append(slug, content, classes, false)? {
            Some(post) => Ok(post),
            // append only declines when only_if_new is set
            None => Err(StoreError::Database(format!("append declined for '{slug}'"))),
        }
    }

    /// Save under a freshly generated slug.
    fn save_new(&self, content: &str, classes: &str) -> Result<Post, StoreError> {
        for _ in 0..GENERATE_ATTEMPTS {
            let slug = Slug::generate();
            if let Some(post) = self.append(&slug, content, classes, true)? {
                return Ok(post);
            }
            log::debug!("generated slug {slug} already taken, retrying");
        }
        Err(StoreError::SlugExhausted(GENERATE_ATTEMPTS))
    }
}

impl<S: ContentStore + ?Sized> ContentStore for std::sync::Arc<S> {
    fn append(
        &self,
        slug: &Slug,
        content: &str,
        classes: &str,
        only_if_new: bool,
    ) -> Result<Option<Post>, StoreError> {
        (**self).append(slug, content, classes, only_if_new)
    }

    fn get(&self, slug: &Slug, version: u64) -> Result<Post, StoreError> {
        (**self).get(slug, version)
    }

    fn latest_version(&self, slug: &Slug) -> Result<u64, StoreError> {
        (**self).latest_version(slug)
    }

    fn versions(&self, slug: &Slug) -> Result<Vec<u64>, StoreError> {
        (**self).versions(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_slug_and_version() {
        let err = StoreError::NotFound {
            slug: Slug::parse("greet").unwrap(),
            version: 3,
        };
        assert_eq!(err.to_string(), "code snippet of 'greet' ver. 3 was not found.");
    }

    #[test]
    fn test_save_new_generates_distinct_slugs() {
        let store = MemoryStore::new();
        let a = store.save_new("a", "").unwrap();
        let b = store.save_new("b", "").unwrap();
        assert_ne!(a.slug, b.slug);
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 1);
    }
}
