//! Durable local cache for collaborative replicas.
//!
//! Column families:
//! - `snapshots` — one LZ4-compressed full document state per room
//! - `updates`   — LZ4-compressed incremental updates, keyed `room/seq`
//!
//! Opening a session loads the snapshot (if any) and replays the update
//! log on top of the in-memory replica; merge idempotence makes replay
//! safe even when the snapshot already contains some of the updates.
//! Closing a session folds the log back into a single snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch,
};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::ErrorKind;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES];

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_open_files: 256,
        }
    }

    /// Small limits for tests against temp directories.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_open_files: 32,
        }
    }
}

/// Cache failures.
#[derive(Debug, Clone)]
pub enum CacheError {
    Database(String),
    Corrupt(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Database(e) => write!(f, "cache database error: {e}"),
            CacheError::Corrupt(e) => write!(f, "cache entry corrupt: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

impl From<CacheError> for ErrorKind {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Database(_) => ErrorKind::Unavailable,
            CacheError::Corrupt(_) => ErrorKind::DataLoss,
        }
    }
}

/// RocksDB-backed replica cache, shared by all sessions in a process.
pub struct ReplicaCache {
    db: DBWithThreadMode<SingleThreaded>,
    sequence: AtomicU64,
}

impl ReplicaCache {
    /// Open (or create) the cache at the configured path.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                // Values are LZ4-compressed by us already.
                cf_opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        Ok(Self {
            db,
            sequence: AtomicU64::new(sequence),
        })
    }

    /// Highest update sequence seen, so appends keep their total order
    /// across restarts.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_UPDATES) else {
            return 0;
        };
        let mut max = 0u64;
        for entry in db.iterator_cf(cf, IteratorMode::Start) {
            let Ok((key, _)) = entry else { continue };
            if let Some(seq) = parse_seq(&key) {
                max = max.max(seq + 1);
            }
        }
        max
    }

    /// Load persisted state for `room_id` into the replica. Returns
    /// whether any prior state existed.
    pub fn load_into(&self, room_id: &str, doc: &Doc) -> Result<bool, CacheError> {
        let mut loaded = false;

        if let Some(cf) = self.db.cf_handle(CF_SNAPSHOTS) {
            if let Some(bytes) = self.db.get_cf(cf, room_id.as_bytes())? {
                apply_compressed(doc, &bytes)?;
                loaded = true;
            }
        }

        let cf = self
            .db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| CacheError::Database("missing updates column family".into()))?;
        let prefix = update_prefix(room_id);
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        for entry in self.db.iterator_cf(cf, mode) {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match apply_compressed(doc, &value) {
                Ok(()) => loaded = true,
                // A corrupt tail entry must not block the rest of the log.
                Err(e) => log::warn!("skipping corrupt cached update for {room_id}: {e}"),
            }
        }

        Ok(loaded)
    }

    /// Append one encoded update (local or remote) to the room's log.
    pub fn append_update(&self, room_id: &str, update: &[u8]) -> Result<(), CacheError> {
        let cf = self
            .db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| CacheError::Database("missing updates column family".into()))?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}{:016x}", update_prefix(room_id), seq);
        let compressed = lz4_flex::compress_prepend_size(update);
        self.db.put_cf(cf, key.as_bytes(), compressed)?;
        Ok(())
    }

    /// Fold the room's update log into a single snapshot.
    pub fn compact(&self, room_id: &str, doc: &Doc) -> Result<(), CacheError> {
        let snapshot = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        let compressed = lz4_flex::compress_prepend_size(&snapshot);

        let snapshots = self
            .db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| CacheError::Database("missing snapshots column family".into()))?;
        let updates = self
            .db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| CacheError::Database("missing updates column family".into()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(snapshots, room_id.as_bytes(), compressed);

        let prefix = update_prefix(room_id);
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        for entry in self.db.iterator_cf(updates, mode) {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            batch.delete_cf(updates, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Number of log entries pending for a room (diagnostics/tests).
    pub fn pending_updates(&self, room_id: &str) -> usize {
        let Some(cf) = self.db.cf_handle(CF_UPDATES) else {
            return 0;
        };
        let prefix = update_prefix(room_id);
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        self.db
            .iterator_cf(cf, mode)
            .take_while(|entry| match entry {
                Ok((key, _)) => key.starts_with(prefix.as_bytes()),
                Err(_) => false,
            })
            .count()
    }
}

/// Room ids are caller-supplied and may contain `/`, the key separator.
/// Escape them so `"r"` and `"r/sub"` can never share a key prefix.
fn escape_room_id(room_id: &str) -> String {
    let mut out = String::with_capacity(room_id.len());
    for c in room_id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2f"),
            other => out.push(other),
        }
    }
    out
}

fn update_prefix(room_id: &str) -> String {
    format!("{}/", escape_room_id(room_id))
}

fn parse_seq(key: &[u8]) -> Option<u64> {
    let key = std::str::from_utf8(key).ok()?;
    let (_, seq) = key.rsplit_once('/')?;
    u64::from_str_radix(seq, 16).ok()
}

fn apply_compressed(doc: &Doc, bytes: &[u8]) -> Result<(), CacheError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let update = Update::decode_v1(&raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| CacheError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Any, Map, WriteTxn};

    fn doc_with_entry(key: &str, value: &str) -> (Doc, Vec<u8>) {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let map = txn.get_or_insert_map("shared");
            map.insert(&mut txn, key, Any::from(value));
        }
        let update = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        (doc, update)
    }

    fn read_entry(doc: &Doc, key: &str) -> Option<String> {
        let map = doc.get_or_insert_map("shared");
        let txn = doc.transact();
        match map.get(&txn, key) {
            Some(yrs::Out::Any(Any::String(s))) => Some(s.to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_load_empty_room() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        let doc = Doc::new();
        assert!(!cache.load_into("r1", &doc).unwrap());
    }

    #[test]
    fn test_append_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        let (_, update) = doc_with_entry("notes", "hello");
        cache.append_update("r1", &update).unwrap();

        let doc = Doc::new();
        assert!(cache.load_into("r1", &doc).unwrap());
        assert_eq!(read_entry(&doc, "notes").as_deref(), Some("hello"));
    }

    #[test]
    fn test_rooms_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        let (_, update) = doc_with_entry("notes", "hello");
        cache.append_update("r1", &update).unwrap();

        let doc = Doc::new();
        assert!(!cache.load_into("other", &doc).unwrap());
        assert!(read_entry(&doc, "notes").is_none());
    }

    #[test]
    fn test_compact_folds_log_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        let (doc, update) = doc_with_entry("notes", "hello");
        cache.append_update("r1", &update).unwrap();
        assert_eq!(cache.pending_updates("r1"), 1);

        cache.compact("r1", &doc).unwrap();
        assert_eq!(cache.pending_updates("r1"), 0);

        let restored = Doc::new();
        assert!(cache.load_into("r1", &restored).unwrap());
        assert_eq!(read_entry(&restored, "notes").as_deref(), Some("hello"));
    }

    #[test]
    fn test_slash_in_room_id_does_not_leak_across_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        let (parent_doc, parent_update) = doc_with_entry("notes", "parent");
        let (_, sub_update) = doc_with_entry("notes", "sub");
        cache.append_update("r", &parent_update).unwrap();
        cache.append_update("r/sub", &sub_update).unwrap();

        // "r" must only see its own update, not "r/sub"'s.
        let doc = Doc::new();
        assert!(cache.load_into("r", &doc).unwrap());
        assert_eq!(read_entry(&doc, "notes").as_deref(), Some("parent"));

        // Compacting "r" must leave "r/sub"'s log untouched.
        cache.compact("r", &parent_doc).unwrap();
        assert_eq!(cache.pending_updates("r"), 0);
        assert_eq!(cache.pending_updates("r/sub"), 1);

        let doc = Doc::new();
        assert!(cache.load_into("r/sub", &doc).unwrap());
        assert_eq!(read_entry(&doc, "notes").as_deref(), Some("sub"));
    }

    #[test]
    fn test_escape_room_id_is_injective() {
        // The raw forms would collide under naive prefixing.
        assert_ne!(update_prefix("r"), update_prefix("r/sub"));
        assert!(!update_prefix("r/sub").starts_with(&update_prefix("r")));
        assert_ne!(update_prefix("r/sub"), update_prefix("r%2fsub"));
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (_, update) = doc_with_entry("k", "v");
        {
            let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();
            cache.append_update("r1", &update).unwrap();
            cache.append_update("r1", &update).unwrap();
        }
        let cache = ReplicaCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        assert!(cache.sequence.load(Ordering::SeqCst) >= 2);
        cache.append_update("r1", &update).unwrap();
        assert_eq!(cache.pending_updates("r1"), 3);
    }
}
