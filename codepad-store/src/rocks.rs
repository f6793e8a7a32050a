//! RocksDB-backed post store.
//!
//! Column families:
//! - `posts`  — one record per version, LZ4-compressed bincode,
//!   keyed by `<slug bytes><0x00><version:8 bytes big-endian>`
//! - `latest` — highest committed version per slug, keyed by slug bytes
//!
//! Slugs never contain NUL, so `<slug><0x00>` is an unambiguous prefix and
//! big-endian versions keep a slug's records in version order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use codepad_core::{unix_now, Post, Slug};

use crate::locks::SlugLocks;
use crate::{ContentStore, StoreError};

const CF_POSTS: &str = "posts";
const CF_LATEST: &str = "latest";

const COLUMN_FAMILIES: &[&str] = &[CF_POSTS, CF_LATEST];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every save, so a returned version is durable (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codepad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk shape of a post; slug and version live in the key.
#[derive(Debug, Serialize, Deserialize)]
struct PostRecord {
    content: String,
    classes: String,
    created_at: u64,
}

impl PostRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn into_post(self, slug: Slug, version: u64) -> Post {
        Post {
            slug,
            version,
            content: self.content,
            classes: self.classes,
            created_at: self.created_at,
        }
    }
}

/// RocksDB-backed content store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; SlugLocks serializes per slug)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    locks: SlugLocks,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened post store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            locks: SlugLocks::default(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_POSTS => {
                // Records are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_LATEST => {
                // Tiny values, read on every save and every "latest" lookup
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn prefix(slug: &Slug) -> Vec<u8> {
        let mut key = Vec::with_capacity(slug.as_str().len() + 9);
        key.extend_from_slice(slug.as_str().as_bytes());
        key.push(0);
        key
    }

    /// Post key: slug bytes + NUL + version (8 bytes big-endian).
    fn post_key(slug: &Slug, version: u64) -> Vec<u8> {
        let mut key = Self::prefix(slug);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn read_latest(&self, slug: &Slug) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LATEST)?;
        match self.db.get_cf(&cf, slug.as_str().as_bytes())? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Deserialization(format!("corrupt latest pointer for '{slug}'"))
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }
}

impl ContentStore for RocksStore {
    fn append(
        &self,
        slug: &Slug,
        content: &str,
        classes: &str,
        only_if_new: bool,
    ) -> Result<Option<Post>, StoreError> {
        self.locks.with_lock(slug, || -> Result<Option<Post>, StoreError> {
            let latest = self.read_latest(slug)?;
            if only_if_new && latest > 0 {
                return Ok(None);
            }
            let version = latest + 1;

            let record = PostRecord {
                content: content.to_string(),
                classes: classes.to_string(),
                created_at: unix_now(),
            };

            // Post and pointer commit together
            let mut batch = WriteBatch::default();
            batch.put_cf(&self.cf(CF_POSTS)?, Self::post_key(slug, version), record.encode()?);
            batch.put_cf(&self.cf(CF_LATEST)?, slug.as_str().as_bytes(), version.to_be_bytes());

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            self.db.write_opt(batch, &write_opts)?;

            log::info!("Saved {slug} version {version}");
            Ok(Some(record.into_post(slug.clone(), version)))
        })
    }

    fn get(&self, slug: &Slug, version: u64) -> Result<Post, StoreError> {
        if version == 0 {
            return Err(StoreError::InvalidVersion(version));
        }
        let cf = self.cf(CF_POSTS)?;
        match self.db.get_cf(&cf, Self::post_key(slug, version))? {
            Some(bytes) => Ok(PostRecord::decode(&bytes)?.into_post(slug.clone(), version)),
            None => Err(StoreError::NotFound {
                slug: slug.clone(),
                version,
            }),
        }
    }

    fn latest_version(&self, slug: &Slug) -> Result<u64, StoreError> {
        self.read_latest(slug)
    }

    fn versions(&self, slug: &Slug) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_POSTS)?;
        let prefix = Self::prefix(slug);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut versions = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[prefix.len()..]);
            versions.push(u64::from_be_bytes(buf));
        }
        Ok(versions)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
