//! The database handle: keyed access to one B-tree plus its transaction
//! overlay.

use std::sync::Arc;

use crate::btree::{BTree, InsertFlags};
use crate::config::DbConfig;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::page_manager::PageManager;
use crate::txn::{OpKind, Probe, Txn, TxnIndex, TxnRegistry};

pub(crate) struct DbCore {
    pub name: u16,
    pub config: DbConfig,
    pub btree: Arc<BTree>,
    pub txn_index: Arc<TxnIndex>,
    pub pm: Arc<PageManager>,
    pub read_only: bool,
}

impl DbCore {
    pub fn new(
        name: u16,
        config: DbConfig,
        btree: Arc<BTree>,
        registry: Arc<TxnRegistry>,
        pm: Arc<PageManager>,
        read_only: bool,
    ) -> Self {
        Self {
            name,
            config,
            btree,
            txn_index: Arc::new(TxnIndex::new(registry)),
            pm,
            read_only,
        }
    }
}

pub struct Db {
    core: Arc<DbCore>,
}

impl Db {
    pub(crate) fn from_core(core: Arc<DbCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> u16 {
        self.core.name
    }

    pub fn config(&self) -> DbConfig {
        self.core.config
    }

    /// Inserts a key/record pair. Fails with `DuplicateKey` when the key
    /// exists and neither overwrite nor duplicate insertion was requested.
    pub fn insert(&self, txn: Option<&Txn>, key: &[u8], record: &[u8]) -> Result<()> {
        self.insert_with(txn, key, record, InsertFlags::empty(), 0)
    }

    pub fn insert_with(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dupe_reference: u32,
    ) -> Result<()> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(Error::InvalidParameter("empty key"));
        }
        let Some(txn) = txn else {
            self.core
                .btree
                .insert_entry(key, record, flags, dupe_reference)?;
            self.core.pm.commit_boundary()?;
            return self.core.pm.purge_cache();
        };

        if !flags.contains(InsertFlags::OVERWRITE) && !flags.any_duplicate() {
            match self.core.txn_index.probe(key, Some(txn.id)) {
                Probe::Conflict(_) => return Err(Error::TxnConflict),
                Probe::Insert(_) => return Err(Error::DuplicateKey),
                Probe::Erased(_) => {}
                Probe::None => {
                    if self.core.btree.contains(key)? {
                        return Err(Error::DuplicateKey);
                    }
                }
            }
        }
        let kind = if flags.any_duplicate() {
            OpKind::InsertDuplicate
        } else if flags.contains(InsertFlags::OVERWRITE) {
            OpKind::InsertOverwrite
        } else {
            OpKind::Insert
        };
        self.core.txn_index.append(
            txn.id,
            key,
            kind,
            flags.dupe_position(dupe_reference),
            dupe_reference,
            record.to_vec(),
        )?;
        Ok(())
    }

    /// Looks a key up, seeing the transaction overlay first.
    pub fn find(&self, txn: Option<&Txn>, key: &[u8]) -> Result<Vec<u8>> {
        let viewer = txn.map(|txn| txn.id);
        match self.core.txn_index.probe(key, viewer) {
            Probe::Conflict(_) => Err(Error::TxnConflict),
            Probe::Erased(_) => Err(Error::KeyNotFound),
            Probe::Insert(op) => Ok(op.record()),
            Probe::None => self.core.btree.lookup(key),
        }
    }

    /// Erases a key (appending an erase op when a transaction is active).
    pub fn erase(&self, txn: Option<&Txn>, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let viewer = txn.map(|txn| txn.id);
        match (txn, self.core.txn_index.probe(key, viewer)) {
            (_, Probe::Conflict(_)) => Err(Error::TxnConflict),
            (_, Probe::Erased(_)) => Err(Error::KeyNotFound),
            (Some(txn), Probe::Insert(_)) => {
                self.append_erase(txn, key)
            }
            (Some(txn), Probe::None) => {
                if !self.core.btree.contains(key)? {
                    return Err(Error::KeyNotFound);
                }
                self.append_erase(txn, key)
            }
            (None, _) => {
                self.core.btree.erase_entry(key, None)?;
                self.core.pm.commit_boundary()?;
                self.core.pm.purge_cache()
            }
        }
    }

    fn append_erase(&self, txn: &Txn, key: &[u8]) -> Result<()> {
        self.core.txn_index.append(
            txn.id,
            key,
            OpKind::Erase,
            crate::blob::DupePosition::Last,
            0,
            Vec::new(),
        )?;
        Ok(())
    }

    /// Opens a hybrid cursor over the B-tree and the transaction overlay.
    pub fn cursor(&self, txn: Option<&Txn>) -> Cursor {
        Cursor::new(
            self.core.btree.clone(),
            self.core.txn_index.clone(),
            txn.map(|txn| txn.id),
        )
    }

    fn check_writable(&self) -> Result<()> {
        if self.core.read_only {
            return Err(Error::InvalidParameter("database is read-only"));
        }
        Ok(())
    }
}
