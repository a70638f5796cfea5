//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `balances` - User balances (key: user_id, value: i64)
//! - `exports` - Append-only outbox log (key: record_id, big-endian)
//! - `groups` - Consumer group cursors (key: group name)
//! - `pending` - Delivered but unacknowledged entries (key: group || 0x00 || record_id)
//! - `meta` - Log sequence and named external cursors
//!
//! Every read-modify-write runs inside a pessimistic RocksDB transaction.
//! Rows are locked with `get_for_update` before they are checked, so the
//! check and the write happen without any other writer in between.

use crate::{
    error::{Error, Result},
    types::{Amount, UserId},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Options, SingleThreaded, Transaction, TransactionDB,
    TransactionDBOptions, TransactionOptions, WriteOptions,
};

/// Column family names
pub(crate) const CF_BALANCES: &str = "balances";
pub(crate) const CF_EXPORTS: &str = "exports";
pub(crate) const CF_GROUPS: &str = "groups";
pub(crate) const CF_PENDING: &str = "pending";
pub(crate) const CF_META: &str = "meta";

const CURSOR_PREFIX: &str = "cursor/";

/// Column family handles are plain references, not `Arc`s
pub(crate) type Db = TransactionDB<SingleThreaded>;

/// Transaction bound to the bank's database
pub(crate) type Txn<'db> = Transaction<'db, Db>;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Db,
    lock_timeout_ms: i64,
    max_retries: u32,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_EXPORTS, Self::cf_options_exports()),
            ColumnFamilyDescriptor::new(CF_GROUPS, Options::default()),
            ColumnFamilyDescriptor::new(CF_PENDING, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let txn_db_opts = TransactionDBOptions::default();
        let db = Db::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(data_dir = ?path, "Opened bank storage");

        Ok(Self {
            db,
            lock_timeout_ms: config.transactions.lock_timeout_ms,
            max_retries: config.transactions.max_retries.max(1),
        })
    }

    fn cf_options_balances() -> Options {
        let mut opts = Options::default();
        // Point lookups only
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_exports() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Config(format!("Column family {} not found", name)))
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// Run `f` inside a transaction and commit it.
    ///
    /// Lock contention is retried up to `transactions.max_retries` times.
    /// Any other error rolls the transaction back and is returned with the
    /// given context attached.
    pub(crate) fn with_txn<T>(
        &self,
        context: impl Fn() -> String,
        mut f: impl FnMut(&Txn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn_opts = TransactionOptions::default();
            txn_opts.set_lock_timeout(self.lock_timeout_ms);
            txn_opts.set_deadlock_detect(true);
            let txn = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);

            let result = match f(&txn) {
                Ok(value) => txn.commit().map(|()| value).map_err(Error::from),
                Err(e) => {
                    if let Err(rollback_err) = txn.rollback() {
                        tracing::warn!(error = %rollback_err, "Transaction rollback failed");
                    }
                    Err(e)
                }
            };

            match result {
                Err(e) if e.is_lock_contention() && attempt < self.max_retries => {
                    tracing::debug!(attempt, context = %context(), "Lock contention, retrying");
                }
                Err(e) => return Err(e.with_context(&context)),
                Ok(value) => return Ok(value),
            }
        }
    }

    // Balance operations

    /// Current balance; 0 for users never seen
    pub fn balance(&self, user: &UserId) -> Result<Amount> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let value = self
            .db
            .get_cf(cf, user.as_bytes())
            .map_err(|e| Error::from(e).with_context(|| format!("balance user={}", user)))?;
        decode_amount(value)
    }

    /// Apply `delta` to the user's balance; fails without writing if the
    /// result would be negative.
    pub fn increment(&self, user: &UserId, delta: Amount) -> Result<Amount> {
        self.with_txn(
            || format!("increment user={} delta={}", user, delta),
            |txn| self.increment_in(txn, user, delta),
        )
    }

    /// Move `amount` from `src` to `dst`. Returns the new (dst, src)
    /// balances.
    pub fn transfer(&self, dst: &UserId, src: &UserId, amount: Amount) -> Result<(Amount, Amount)> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }
        self.with_txn(
            || format!("transfer dst={} src={} amount={}", dst, src, amount),
            |txn| self.transfer_in(txn, dst, src, amount),
        )
    }

    pub(crate) fn increment_in(&self, txn: &Txn<'_>, user: &UserId, delta: Amount) -> Result<Amount> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let current = decode_amount(txn.get_for_update_cf(cf, user.as_bytes(), true)?)?;

        let new_balance = current
            .checked_add(delta)
            .ok_or_else(|| Error::Overflow(user.clone()))?;
        if new_balance < 0 {
            return Err(Error::InsufficientFunds {
                user: user.clone(),
                balance: current,
                requested: delta.saturating_neg(),
            });
        }

        txn.put_cf(cf, user.as_bytes(), encode_amount(new_balance)?)?;

        tracing::debug!(user = %user, delta, new_balance, "Balance incremented");
        Ok(new_balance)
    }

    fn transfer_in(
        &self,
        txn: &Txn<'_>,
        dst: &UserId,
        src: &UserId,
        amount: Amount,
    ) -> Result<(Amount, Amount)> {
        let cf = self.cf_handle(CF_BALANCES)?;

        if dst == src {
            let balance = decode_amount(txn.get_for_update_cf(cf, src.as_bytes(), true)?)?;
            if balance < amount {
                return Err(Error::InsufficientFunds {
                    user: src.clone(),
                    balance,
                    requested: amount,
                });
            }
            return Ok((balance, balance));
        }

        // Lock in key order so opposing transfers cannot deadlock
        let (first, second) = if dst < src { (dst, src) } else { (src, dst) };
        let first_balance = decode_amount(txn.get_for_update_cf(cf, first.as_bytes(), true)?)?;
        let second_balance = decode_amount(txn.get_for_update_cf(cf, second.as_bytes(), true)?)?;
        let (dst_balance, src_balance) = if first == dst {
            (first_balance, second_balance)
        } else {
            (second_balance, first_balance)
        };

        if src_balance < amount {
            return Err(Error::InsufficientFunds {
                user: src.clone(),
                balance: src_balance,
                requested: amount,
            });
        }

        let new_src = src_balance - amount;
        let new_dst = dst_balance
            .checked_add(amount)
            .ok_or_else(|| Error::Overflow(dst.clone()))?;

        txn.put_cf(cf, dst.as_bytes(), encode_amount(new_dst)?)?;
        txn.put_cf(cf, src.as_bytes(), encode_amount(new_src)?)?;

        tracing::debug!(dst = %dst, src = %src, amount, new_dst, new_src, "Balance transferred");
        Ok((new_dst, new_src))
    }

    // External cursor operations

    /// Last value stored under the named cursor
    pub fn cursor(&self, name: &str) -> Result<Option<String>> {
        let cf = self.cf_handle(CF_META)?;
        let value = self
            .db
            .get_cf(cf, cursor_key(name))
            .map_err(|e| Error::from(e).with_context(|| format!("cursor name={}", name)))?;
        value.map(decode_cursor).transpose()
    }

    /// Overwrite the named cursor
    pub fn set_cursor(&self, name: &str, value: &str) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        self.with_txn(
            || format!("set_cursor name={}", name),
            |txn| {
                txn.put_cf(cf, cursor_key(name), value.as_bytes())?;
                Ok(())
            },
        )
    }

    /// Credit `amount` to `user` and move the named cursor to `cursor`, as one
    /// unit. If the cursor already holds `cursor` the deposit was applied
    /// before and only the current balance is returned.
    pub fn deposit(
        &self,
        user: &UserId,
        amount: Amount,
        cursor_name: &str,
        cursor: &str,
    ) -> Result<(Amount, bool)> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }
        let cf_meta = self.cf_handle(CF_META)?;
        let cf_balances = self.cf_handle(CF_BALANCES)?;

        self.with_txn(
            || format!("deposit user={} amount={} cursor={}", user, amount, cursor),
            |txn| {
                let key = cursor_key(cursor_name);
                let current = txn
                    .get_for_update_cf(cf_meta, &key, true)?
                    .map(decode_cursor)
                    .transpose()?;

                if current.as_deref() == Some(cursor) {
                    let balance =
                        decode_amount(txn.get_for_update_cf(cf_balances, user.as_bytes(), false)?)?;
                    return Ok((balance, false));
                }

                let balance = self.increment_in(txn, user, amount)?;
                txn.put_cf(cf_meta, &key, cursor.as_bytes())?;
                Ok((balance, true))
            },
        )
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn decode_amount(value: Option<Vec<u8>>) -> Result<Amount> {
    match value {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(0),
    }
}

fn encode_amount(amount: Amount) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&amount)?)
}

fn cursor_key(name: &str) -> Vec<u8> {
    let mut key = CURSOR_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_cursor(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Config(format!("cursor is not UTF-8: {}", e)))
}
