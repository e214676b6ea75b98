//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: encoded replica state per document (LZ4 compressed)
//! - `metadata` : document metadata (bincode: version, sizes, timestamps)
//!
//! Each save replaces the previous snapshot. Snapshot and metadata are
//! written in one batch so a reader never observes one without the other.
//!
//! The inherent methods block. Through [`Persistence`] they run on tokio's
//! blocking pool, so a slow fsync never stalls the executor.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

use crate::collaborators::{DocumentId, Persistence};
use crate::error::StoreError;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every save (default: true, saves only happen on eviction)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("realtime_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    /// Number of saves, starting at 1
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DocumentMetadata {
    fn new(doc_id: DocumentId) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`Persistence`]. Clones share the same database.
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<DB>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 compressed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace a document's snapshot.
    pub fn save_snapshot(
        &self,
        doc_id: DocumentId,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load and decompress a document snapshot.
    pub fn load_snapshot(&self, doc_id: DocumentId) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, doc_id.as_bytes())?.is_some())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// Ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid document key".into()))?;
            ids.push(DocumentId(Uuid::from_bytes(bytes)));
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Run a blocking store operation off the async executor.
async fn blocking<T, F>(store: &DocumentStore, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&DocumentStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| StoreError::Unavailable(format!("Storage task failed: {e}")))?
}

#[async_trait]
impl Persistence for DocumentStore {
    async fn load_latest_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        blocking(self, move |store| match store.load_snapshot(id) {
            Ok(content) => Ok(Some(content)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn save_content(&self, id: DocumentId, content: &[u8]) -> Result<(), StoreError> {
        let content = content.to_vec();
        let meta = blocking(self, move |store| store.save_snapshot(id, &content)).await?;
        log::debug!(
            "Saved {id} v{} ({} -> {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc_id = DocumentId::new();
        let data = b"collaborative state with enough repetition repetition repetition".to_vec();

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        assert_eq!(meta.doc_id, doc_id);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);

        assert_eq!(store.load_snapshot(doc_id).unwrap(), data);
        assert!(store.document_exists(doc_id).unwrap());
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        assert!(matches!(store.load_snapshot(id), Err(StoreError::NotFound(missing)) if missing == id));
        assert!(!store.document_exists(id).unwrap());
    }

    #[test]
    fn test_save_replaces_and_bumps_version() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        let first = store.save_snapshot(id, b"one").unwrap();
        let second = store.save_snapshot(id, b"two").unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.load_snapshot(id).unwrap(), b"two");
        assert_eq!(store.load_metadata(id).unwrap(), second);
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        let data = vec![42u8; 1_000_000];

        let meta = store.save_snapshot(id, &data).unwrap();
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.load_snapshot(id).unwrap().len(), 1_000_000);
    }

    #[test]
    fn test_list_documents() {
        let (_dir, store) = open_temp();
        let a = DocumentId::new();
        let b = DocumentId::new();
        store.save_snapshot(a, b"a").unwrap();
        store.save_snapshot(b, b"b").unwrap();

        let mut listed = store.list_documents().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let id = DocumentId::new();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(id, b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot(id).unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_persistence_missing_document_is_none() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        assert_eq!(store.load_latest_content(id).await.unwrap(), None);

        store.save_content(id, b"state").await.unwrap();
        assert_eq!(
            store.load_latest_content(id).await.unwrap(),
            Some(b"state".to_vec())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_work_does_not_stall_the_executor() {
        let (_dir, store) = open_temp();
        let slow = blocking(&store, |store| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            store.save_snapshot(DocumentId::new(), b"slow").map(|_| ())
        });

        tokio::pin!(slow);

        // Inline, the slow operation would finish before the timer is polled
        let timer_first = tokio::select! {
            biased;
            done = &mut slow => {
                done.unwrap();
                false
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => true,
        };
        assert!(timer_first);
        slow.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_saves_through_persistence() {
        let (_dir, store) = open_temp();
        let ids: Vec<DocumentId> = (0..8).map(|_| DocumentId::new()).collect();

        let saves: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = store.clone();
                tokio::spawn(async move { store.save_content(id, id.as_bytes()).await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        for id in ids {
            assert_eq!(
                store.load_latest_content(id).await.unwrap(),
                Some(id.as_bytes().to_vec())
            );
        }
    }

    #[test]
    fn test_clones_share_the_database() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        store.clone().save_snapshot(id, b"shared").unwrap();
        assert_eq!(store.load_snapshot(id).unwrap(), b"shared");
    }
}
