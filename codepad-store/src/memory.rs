//! In-process post store.
//!
//! Same allocation rules as [`RocksStore`](crate::RocksStore): per-slug lock,
//! append-only history. Nothing survives the process.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use codepad_core::{unix_now, Post, Slug};

use crate::locks::SlugLocks;
use crate::{ContentStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    /// slug → versions, index `v - 1` holds version `v`
    posts: RwLock<HashMap<Slug, Vec<Arc<Post>>>>,
    locks: SlugLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct slugs.
    pub fn slug_count(&self) -> usize {
        self.posts.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ContentStore for MemoryStore {
    fn append(
        &self,
        slug: &Slug,
        content: &str,
        classes: &str,
        only_if_new: bool,
    ) -> Result<Option<Post>, StoreError> {
        self.locks.with_lock(slug, || -> Result<Option<Post>, StoreError> {
            let latest = self.latest_version(slug)?;
            if only_if_new && latest > 0 {
                return Ok(None);
            }
            let post = Post {
                slug: slug.clone(),
                version: latest + 1,
                content: content.to_string(),
                classes: classes.to_string(),
                created_at: unix_now(),
            };

            self.posts
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(slug.clone())
                .or_default()
                .push(Arc::new(post.clone()));

            log::info!("Saved {slug} version {} (memory)", post.version);
            Ok(Some(post))
        })
    }

    fn get(&self, slug: &Slug, version: u64) -> Result<Post, StoreError> {
        if version == 0 {
            return Err(StoreError::InvalidVersion(version));
        }
        let posts = self.posts.read().unwrap_or_else(PoisonError::into_inner);
        posts
            .get(slug)
            .and_then(|history| history.get((version - 1) as usize))
            .map(|post| Post::clone(post))
            .ok_or_else(|| StoreError::NotFound {
                slug: slug.clone(),
                version,
            })
    }

    fn latest_version(&self, slug: &Slug) -> Result<u64, StoreError> {
        let posts = self.posts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(posts.get(slug).map_or(0, |history| history.len() as u64))
    }

    fn versions(&self, slug: &Slug) -> Result<Vec<u64>, StoreError> {
        let posts = self.posts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(posts
            .get(slug)
            .map(|history| history.iter().map(|p| p.version).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(s: &str) -> Slug {
        Slug::parse(s).unwrap()
    }

    #[test]
    fn test_versions_increment_per_slug() {
        let store = MemoryStore::new();
        assert_eq!(store.save(&slug("a"), "1", "").unwrap().version, 1);
        assert_eq!(store.save(&slug("a"), "2", "").unwrap().version, 2);
        assert_eq!(store.save(&slug("b"), "1", "").unwrap().version, 1);
        assert_eq!(store.versions(&slug("a")).unwrap(), vec![1, 2]);
        assert_eq!(store.slug_count(), 2);
    }

    #[test]
    fn test_get_errors() {
        let store = MemoryStore::new();
        assert_eq!(store.get(&slug("a"), 0), Err(StoreError::InvalidVersion(0)));
        assert!(matches!(store.get(&slug("a"), 1), Err(StoreError::NotFound { .. })));
        assert_eq!(store.latest_version(&slug("a")).unwrap(), 0);
    }
}
