//! Key-ordered record store using RocksDB.
//!
//! This module provides the [`KeyStore`] that backs the two-phase delimited
//! workflow. `prepare` upserts every source record under its encoded
//! [`CompositeKey`]; `produce` then walks the store in key-byte order and
//! folds consecutive entries of the same group into one emission.
//!
//! # Key Design
//!
//! - Keys: [`CompositeKey::encode`] bytes (big-endian two's complement, so
//!   negative integers sort after positive ones)
//! - Values: the serialized [`Record`] (JSON)
//! - Last write wins: re-inserting a key replaces the previous record
//! - Iteration order is the key encoding's byte order

use crate::error::{Error, Result};
use crate::source::{Record, RecordSource};
use rawdata_core::metrics::RECORDS_PREPARED;
use rawdata_core::{CompositeKey, KeySchema};
use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Records buffered in one write batch during prepare.
const PREPARE_BATCH_SIZE: usize = 10_000;

/// Counts reported by [`KeyStore::prepare`].
#[derive(Debug, Clone, Default)]
pub struct PrepareStats {
    /// Records read from the source.
    pub records_read: usize,
    /// Write batches committed.
    pub batches: usize,
}

/// Counts reported by [`KeyStore::produce`].
#[derive(Debug, Clone, Default)]
pub struct ProduceCounts {
    /// Stored entries visited.
    pub entries: usize,
    /// Groups handed to the emitter.
    pub groups: usize,
}

/// RocksDB-backed store of records keyed by [`CompositeKey`].
pub struct KeyStore {
    db: Option<DBWithThreadMode<MultiThreaded>>,
    schema: Arc<KeySchema>,
    path: PathBuf,
}

impl KeyStore {
    /// Open or create a key store at the given path.
    ///
    /// ```no_run
    /// use rawdata_core::{FieldType, KeySchema};
    /// use rawdata_migrate::KeyStore;
    ///
    /// let schema = KeySchema::new([("id", FieldType::Long)], &["id"])?;
    /// let store = KeyStore::open("./data/keystore", schema)?;
    /// # Ok::<(), rawdata_migrate::Error>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, schema: Arc<KeySchema>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening key store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Bulk-load workload: large memtables, few reads until produce
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self {
            db: Some(db),
            schema,
            path: path.to_path_buf(),
        })
    }

    pub fn schema(&self) -> &Arc<KeySchema> {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<&DBWithThreadMode<MultiThreaded>> {
        self.db
            .as_ref()
            .ok_or_else(|| Error::Config(format!("key store {} is closed", self.path.display())))
    }

    /// Upsert one record. An existing entry with the same key is replaced.
    pub fn put(&self, key: &CompositeKey, record: &Record) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.db()?.put(key.encode(), value)?;
        Ok(())
    }

    /// Look up a record by key.
    pub fn get(&self, key: &CompositeKey) -> Result<Option<Record>> {
        match self.db()?.get(key.encode())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ingest every record of a source, keyed by `key_fn`.
    ///
    /// Records are written in batches; within and across batches the last
    /// record written for a key wins.
    pub fn prepare<S, F>(&self, source: &mut S, mut key_fn: F) -> Result<PrepareStats>
    where
        S: RecordSource<Item = Record>,
        F: FnMut(&Record) -> Result<CompositeKey>,
    {
        let db = self.db()?;
        info!("Preparing key store from {} source", source.name());

        let mut stats = PrepareStats::default();
        let mut batch = WriteBatch::default();
        let mut key_buf = Vec::new();

        source.process(|record| {
            let key = key_fn(&record)?;
            key_buf.clear();
            key.encode_into(&mut key_buf);
            batch.put(&key_buf, serde_json::to_vec(&record)?);
            stats.records_read += 1;

            if batch.len() >= PREPARE_BATCH_SIZE {
                let full = std::mem::take(&mut batch);
                let count = full.len();
                db.write(full)?;
                stats.batches += 1;
                metrics::counter!(RECORDS_PREPARED).increment(count as u64);
                debug!("Committed prepare batch of {} records", count);
            }
            Ok(true)
        })?;

        if !batch.is_empty() {
            let count = batch.len();
            db.write(batch)?;
            stats.batches += 1;
            metrics::counter!(RECORDS_PREPARED).increment(count as u64);
        }

        info!(
            "Prepared {} records in {} batches (~{} distinct keys)",
            stats.records_read,
            stats.batches,
            self.approximate_count().unwrap_or(0)
        );
        Ok(stats)
    }

    /// Visit every stored entry in key order.
    pub fn for_each<F>(&self, mut visit: F) -> Result<usize>
    where
        F: FnMut(CompositeKey, Record) -> Result<()>,
    {
        let db = self.db()?;
        let mut count = 0;

        for item in db.iterator(IteratorMode::Start) {
            let (key_bytes, value) = item?;
            let key = CompositeKey::decode(&self.schema, &key_bytes)?;
            let record: Record = serde_json::from_slice(&value)?;
            visit(key, record)?;
            count += 1;
        }

        Ok(count)
    }

    /// Emit stored entries in key order, folding runs of the same group.
    ///
    /// Consecutive entries whose keys are [`CompositeKey::same_group`] are
    /// handed to `emit` together; a group is emitted as soon as the next
    /// key starts a new group, and the final group after iteration ends.
    pub fn produce<F>(&self, mut emit: F) -> Result<ProduceCounts>
    where
        F: FnMut(Vec<(CompositeKey, Record)>) -> Result<()>,
    {
        let mut counts = ProduceCounts::default();
        let mut group: Vec<(CompositeKey, Record)> = Vec::new();

        counts.entries = self.for_each(|key, record| {
            if let Some((head, _)) = group.first()
                && !head.same_group(&key)
            {
                counts.groups += 1;
                emit(std::mem::take(&mut group))?;
            }
            group.push((key, record));
            Ok(())
        })?;

        if !group.is_empty() {
            counts.groups += 1;
            emit(group)?;
        }

        debug!(
            "Produced {} groups from {} entries",
            counts.groups, counts.entries
        );
        Ok(counts)
    }

    /// Get the approximate number of keys in the database.
    pub fn approximate_count(&self) -> Result<u64> {
        let count = self
            .db()?
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(count)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db()?.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> KeyStoreStats {
        KeyStoreStats {
            approximate_keys: self.approximate_count().unwrap_or(0),
        }
    }

    /// Flush and release the database. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(db) = self.db.take() {
            db.flush()?;
            info!("Closed key store at {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_none()
    }
}

/// Statistics about the key store.
#[derive(Debug, Clone)]
pub struct KeyStoreStats {
    /// Approximate number of keys in the database.
    pub approximate_keys: u64,
}
