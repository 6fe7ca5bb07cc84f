//! Storage layer using RocksDB
//!
//! Rows are cached in memory together with their indices and rebuilt from
//! the database on open. Every mutation is written to RocksDB before it is
//! applied to the cache. Without a data directory the cache is the only copy.
//!
//! # Column Families
//!
//! - `transactions` - Wallet rows (key: append sequence, big-endian u64)
//! - `bookings` - Parcel booking records (key: booking_id), written by the
//!   parcel engine through [`Storage::put_booking`]

use crate::{
    error::{Error, Result},
    types::{ActorId, TransactionStatus, WalletTransaction},
    Config,
};
use chrono::Utc;
use parking_lot::RwLock;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, IteratorMode, Options, WriteOptions,
    DB,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_BOOKINGS: &str = "bookings";

#[derive(Default)]
struct Rows {
    rows: Vec<WalletTransaction>,
    by_id: HashMap<Uuid, usize>,
    by_actor: HashMap<ActorId, Vec<usize>>,
}

impl Rows {
    fn insert(&mut self, transaction: WalletTransaction) -> Result<()> {
        if self.by_id.contains_key(&transaction.transaction_id) {
            return Err(Error::DuplicateTransaction(transaction.transaction_id));
        }
        let position = self.rows.len();
        self.by_id.insert(transaction.transaction_id, position);
        self.by_actor
            .entry(transaction.actor_id.clone())
            .or_default()
            .push(position);
        self.rows.push(transaction);
        Ok(())
    }

    fn decidable(&self, transaction_id: Uuid, status: TransactionStatus) -> Result<usize> {
        let position = *self
            .by_id
            .get(&transaction_id)
            .ok_or(Error::TransactionNotFound(transaction_id))?;

        if !status.is_final() {
            return Err(Error::StateConflict(format!(
                "Transaction {} cannot move back to {}",
                transaction_id,
                status.as_str()
            )));
        }

        let current = self.rows[position].status;
        if current.is_final() {
            return Err(Error::StateConflict(format!(
                "Transaction {} already {}",
                transaction_id,
                current.as_str()
            )));
        }

        Ok(position)
    }
}

/// Storage for wallet transactions and booking records
pub struct Storage {
    rows: RwLock<Rows>,
    db: Option<DB>,
    sync_writes: bool,
}

impl Storage {
    /// Open storage, loading every row if a data directory is configured
    pub fn open(config: &Config) -> Result<Self> {
        let Some(path) = &config.data_dir else {
            return Ok(Self::in_memory());
        };

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        let tuning = &config.rocksdb;
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_target_file_size_base(tuning.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            tuning.level0_file_num_compaction_trigger,
        );
        db_opts.set_compaction_style(DBCompactionStyle::Universal);
        if tuning.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_transactions()),
            ColumnFamilyDescriptor::new(CF_BOOKINGS, Self::cf_options_bookings()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let rows = Self::load_rows(&db)?;

        tracing::info!(
            path = %path.display(),
            transactions = rows.rows.len(),
            "Opened wallet database"
        );

        Ok(Self {
            rows: RwLock::new(rows),
            db: Some(db),
            sync_writes: config.sync_writes,
        })
    }

    /// Storage without a database
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            db: None,
            sync_writes: false,
        }
    }

    /// Check if writes reach disk
    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    // Column family options

    fn cf_options_transactions() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_bookings() -> Options {
        let mut opts = Options::default();
        // Rewritten on every item change, favour speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
        db.cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn load_rows(db: &DB) -> Result<Rows> {
        let cf = Self::cf_handle(db, CF_TRANSACTIONS)?;
        let mut rows = Rows::default();

        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let sequence = Self::decode_sequence(&key)?;
            if sequence != rows.rows.len() as u64 {
                return Err(Error::Storage(format!(
                    "Transaction sequence gap: expected {}, found {}",
                    rows.rows.len(),
                    sequence
                )));
            }
            rows.insert(serde_json::from_slice(&value)?)?;
        }

        Ok(rows)
    }

    fn decode_sequence(key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Error::Storage(format!("Malformed transaction key of {} bytes", key.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn put_row(&self, position: usize, transaction: &WalletTransaction) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let cf = Self::cf_handle(db, CF_TRANSACTIONS)?;
        let key = (position as u64).to_be_bytes();
        let value = serde_json::to_vec(transaction)?;
        db.put_cf_opt(cf, key, value, &self.write_options())?;
        Ok(())
    }

    // Transaction operations

    /// Append a new row (database first, then memory)
    pub fn append(&self, transaction: &WalletTransaction) -> Result<()> {
        let mut rows = self.rows.write();

        if rows.by_id.contains_key(&transaction.transaction_id) {
            return Err(Error::DuplicateTransaction(transaction.transaction_id));
        }

        self.put_row(rows.rows.len(), transaction)?;
        rows.insert(transaction.clone())?;

        tracing::debug!(
            transaction_id = %transaction.transaction_id,
            actor_id = %transaction.actor_id,
            amount = %transaction.amount,
            currency = %transaction.currency,
            transaction_type = %transaction.transaction_type,
            "Transaction appended"
        );

        Ok(())
    }

    /// Move a PENDING row to a final status
    pub fn decide(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<WalletTransaction> {
        let mut rows = self.rows.write();
        let position = rows.decidable(transaction_id, status)?;

        let mut decided = rows.rows[position].clone();
        decided.status = status;
        decided.decided_at = Some(Utc::now());
        decided.failure_reason = reason;

        self.put_row(position, &decided)?;
        rows.rows[position] = decided.clone();
        Ok(decided)
    }

    /// Get row by ID
    pub fn get(&self, transaction_id: Uuid) -> Result<WalletTransaction> {
        let rows = self.rows.read();
        rows.by_id
            .get(&transaction_id)
            .map(|&position| rows.rows[position].clone())
            .ok_or(Error::TransactionNotFound(transaction_id))
    }

    /// All rows for an actor, in append order
    pub fn for_actor(&self, actor_id: &ActorId) -> Vec<WalletTransaction> {
        let rows = self.rows.read();
        rows.by_actor
            .get(actor_id)
            .map(|positions| positions.iter().map(|&p| rows.rows[p].clone()).collect())
            .unwrap_or_default()
    }

    /// Fold over an actor's rows without cloning them
    pub fn fold_actor<T>(
        &self,
        actor_id: &ActorId,
        init: T,
        mut f: impl FnMut(T, &WalletTransaction) -> T,
    ) -> T {
        let rows = self.rows.read();
        match rows.by_actor.get(actor_id) {
            Some(positions) => positions
                .iter()
                .fold(init, |acc, &p| f(acc, &rows.rows[p])),
            None => init,
        }
    }

    /// All rows, in append order
    pub fn all(&self) -> Vec<WalletTransaction> {
        self.rows.read().rows.clone()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.read().rows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Booking operations

    /// Store an encoded booking record, replacing any previous one
    ///
    /// A no-op without a database.
    pub fn put_booking(&self, booking_id: Uuid, record: &[u8]) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let cf = Self::cf_handle(db, CF_BOOKINGS)?;
        db.put_cf_opt(cf, booking_id.as_bytes(), record, &self.write_options())?;
        Ok(())
    }

    /// Every stored booking record, in booking ID order
    pub fn bookings(&self) -> Result<Vec<Vec<u8>>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let cf = Self::cf_handle(db, CF_BOOKINGS)?;
        db.iterator_cf(cf, IteratorMode::Start)
            .map(|item| -> Result<Vec<u8>> {
                let (_, value) = item?;
                Ok(value.into_vec())
            })
            .collect()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("transactions", &self.len())
            .field("persistent", &self.db.is_some())
            .finish()
    }
}
