//! The environment: one database file, its device, header, changeset and
//! page manager, plus transaction begin/commit/abort.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::blob::DupePosition;
use crate::btree::{BTree, InsertFlags};
use crate::changeset::{Changeset, LsnManager};
use crate::config::{DbConfig, EnvConfig};
use crate::db::{Db, DbCore};
use crate::device::{shared, Device, FileDevice, MemoryDevice, SharedDevice};
use crate::error::{Error, Result};
use crate::header::{DbDescriptor, HeaderPage};
use crate::page::{Page, PageKind, PAGE_HDR_LEN};
use crate::page_manager::PageManager;
use crate::txn::{OpKind, Txn, TxnRegistry, TxnState};

pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    config: EnvConfig,
    changeset: Arc<Changeset>,
    lsn: Arc<LsnManager>,
    pm: Arc<PageManager>,
    header: Arc<HeaderPage>,
    registry: Arc<TxnRegistry>,
    dbs: Mutex<HashMap<u16, Arc<DbCore>>>,
    closed: AtomicBool,
}

impl Env {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>, config: EnvConfig) -> Result<Self> {
        config.validate()?;
        if config.in_memory {
            return Err(Error::InvalidParameter(
                "in-memory environments have no file; use Env::memory",
            ));
        }
        let device: Box<dyn Device> = if config.read_only {
            Box::new(FileDevice::open_read_only(path.as_ref())?)
        } else {
            Box::new(FileDevice::open(path.as_ref())?)
        };
        let env = Self::bootstrap(shared(device), config)?;
        info!(path = %path.as_ref().display(), "environment open");
        Ok(env)
    }

    /// Creates a purely in-memory environment.
    pub fn memory(config: EnvConfig) -> Result<Self> {
        let config = EnvConfig {
            in_memory: true,
            ..config
        };
        config.validate()?;
        Self::bootstrap(shared(Box::new(MemoryDevice::new())), config)
    }

    fn bootstrap(device: SharedDevice, mut config: EnvConfig) -> Result<Self> {
        let fresh = device.lock().len() == 0;
        let header = if fresh {
            if config.read_only {
                return Err(Error::InvalidParameter(
                    "cannot create a database read-only",
                ));
            }
            let page_size = config.page_size as u64;
            {
                let mut device = device.lock();
                device.alloc_page(page_size)?;
            }
            let page = Arc::new(Page::new(0, config.page_size as usize));
            page.set_kind(PageKind::Header);
            let header = HeaderPage::new(page);
            header.format(config.page_size);
            header
        } else {
            // The page size recorded in the file wins over the config.
            let page_size = probe_page_size(&device)?;
            config.page_size = page_size;
            config.validate()?;
            let page = Arc::new(Page::new(0, page_size as usize));
            {
                let mut device = device.lock();
                page.read_from(device.as_mut())?;
            }
            if page.kind() != PageKind::Header {
                return Err(Error::Corruption("first page is not a header page"));
            }
            let header = HeaderPage::new(page);
            header.validate()?;
            header
        };

        let header = Arc::new(header);
        let lsn = Arc::new(LsnManager::new(header.lsn() + 1));
        let changeset = Arc::new(Changeset::new(device.clone()));
        let pm = Arc::new(PageManager::new(
            config.clone(),
            device.clone(),
            changeset.clone(),
            lsn.clone(),
        ));
        pm.set_header(header.clone())?;

        if !fresh {
            let blobid = header.page_manager_blobid();
            if blobid != 0 {
                pm.initialize(blobid)?;
            }
        }

        Ok(Self {
            inner: Arc::new(EnvInner {
                config,
                changeset,
                lsn,
                pm,
                header,
                registry: Arc::new(TxnRegistry::new()),
                dbs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    /// The page manager, exposed for plumbing-level tests and tools.
    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.inner.pm
    }

    /// Creates a database under `name` (non-zero, unique per file).
    pub fn create_db(&self, name: u16, config: DbConfig) -> Result<Db> {
        self.check_open()?;
        self.check_writable()?;
        if name == 0 {
            return Err(Error::InvalidParameter("database name 0 is reserved"));
        }
        config.validate()?;
        if self.inner.header.find_db(name).is_some() {
            return Err(Error::InvalidParameter("database already exists"));
        }
        let Some(slot) = self.inner.header.free_slot() else {
            return Err(Error::LimitsReached);
        };
        let mut descriptor = DbDescriptor {
            name,
            key_size: config.key_size,
            flags: 0,
            root: 0,
        };
        descriptor.set_duplicates(config.enable_duplicates);
        self.inner.header.set_descriptor(slot, &descriptor);
        info!(name, slot, "database created");
        self.db_handle(name, slot, config)
    }

    /// Opens an existing database.
    pub fn open_db(&self, name: u16) -> Result<Db> {
        self.check_open()?;
        if let Some(core) = self.inner.dbs.lock().get(&name) {
            return Ok(Db::from_core(core.clone()));
        }
        let Some((slot, descriptor)) = self.inner.header.find_db(name) else {
            return Err(Error::KeyNotFound);
        };
        let config = DbConfig {
            key_size: descriptor.key_size,
            enable_duplicates: descriptor.duplicates(),
        };
        self.db_handle(name, slot, config)
    }

    fn db_handle(&self, name: u16, slot: usize, config: DbConfig) -> Result<Db> {
        let btree = Arc::new(BTree::open(
            self.inner.pm.clone(),
            self.inner.header.clone(),
            slot,
        ));
        let core = Arc::new(DbCore::new(
            name,
            config,
            btree,
            self.inner.registry.clone(),
            self.inner.pm.clone(),
            self.inner.config.read_only,
        ));
        self.inner.dbs.lock().insert(name, core.clone());
        Ok(Db::from_core(core))
    }

    /// Flushes and drops every page owned by `db`; the handle becomes
    /// stale.
    pub fn close_db(&self, db: &Db) -> Result<()> {
        self.check_open()?;
        let name = db.name();
        self.inner.dbs.lock().remove(&name);
        self.inner.pm.close_database(name)
    }

    pub fn txn_begin(&self) -> Result<Txn> {
        self.check_open()?;
        self.check_writable()?;
        Ok(Txn {
            id: self.inner.registry.begin(),
        })
    }

    /// Commits: applies the transaction's ops to the B-trees in order,
    /// then checkpoints and flushes the changeset when recovery is on.
    pub fn txn_commit(&self, txn: Txn) -> Result<()> {
        self.check_open()?;
        self.inner
            .registry
            .set_state(txn.id, TxnState::Committed);
        for core in self.inner.dbs.lock().values() {
            let ops = core.txn_index.take_txn_ops(txn.id);
            for (key, op) in ops {
                match op.kind {
                    OpKind::Insert | OpKind::InsertOverwrite => {
                        core.btree.insert_entry(
                            &key,
                            &op.record(),
                            InsertFlags::OVERWRITE,
                            op.referenced_dupe,
                        )?;
                    }
                    OpKind::InsertDuplicate => {
                        let flags = InsertFlags::DUPLICATE | dupe_flags(op.dupe_position);
                        core.btree.insert_entry(
                            &key,
                            &op.record(),
                            flags,
                            op.referenced_dupe,
                        )?;
                    }
                    OpKind::Erase => {
                        let dupe = (op.referenced_dupe > 0)
                            .then(|| op.referenced_dupe - 1);
                        match core.btree.erase_entry(&key, dupe) {
                            Ok(()) | Err(Error::KeyNotFound) => {}
                            Err(other) => return Err(other),
                        }
                    }
                    OpKind::Nop => {}
                }
            }
        }
        self.inner.registry.forget(txn.id);
        self.inner.pm.commit_boundary()?;
        self.inner.pm.purge_cache()
    }

    /// Aborts: the transaction's ops are discarded. The registry keeps the
    /// aborted state so stale op handles stay invisible.
    pub fn txn_abort(&self, txn: Txn) -> Result<()> {
        self.check_open()?;
        self.inner.registry.set_state(txn.id, TxnState::Aborted);
        for core in self.inner.dbs.lock().values() {
            core.txn_index.take_txn_ops(txn.id);
        }
        if self.inner.config.enable_recovery {
            self.inner.changeset.clear();
        }
        Ok(())
    }

    /// Final checkpoint, reclaim, flush. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let names: Vec<u16> = self.inner.dbs.lock().keys().copied().collect();
        for name in names {
            self.inner.pm.close_database(name)?;
        }
        self.inner.dbs.lock().clear();
        if !self.inner.config.read_only {
            self.inner.header.set_lsn(self.inner.lsn.current());
        }
        self.inner.pm.close()?;
        info!("environment closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidParameter("environment is closed"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.config.read_only {
            return Err(Error::InvalidParameter("environment is read-only"));
        }
        Ok(())
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            if let Err(error) = self.close() {
                warn!(%error, "close on drop failed");
            }
        }
    }
}

fn dupe_flags(position: DupePosition) -> InsertFlags {
    match position {
        DupePosition::First => InsertFlags::DUPLICATE_FIRST,
        DupePosition::Before(_) => InsertFlags::DUPLICATE_BEFORE,
        DupePosition::After(_) => InsertFlags::DUPLICATE_AFTER,
        DupePosition::Last => InsertFlags::DUPLICATE_LAST,
    }
}

/// Reads the page size out of the header page before the page size is
/// known; every valid page is at least 4 KiB.
fn probe_page_size(device: &SharedDevice) -> Result<u32> {
    const PROBE: usize = 4096;
    let mut buf = [0u8; PROBE];
    {
        let mut device = device.lock();
        if (device.len() as usize) < PROBE {
            return Err(Error::Corruption("file too short for a header page"));
        }
        device.read_at(0, &mut buf)?;
    }
    // Header-page payload: magic [0..4), version [4..6), page size [8..12).
    let payload = &buf[PAGE_HDR_LEN..];
    let page_size = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    if !page_size.is_power_of_two() || !(1 << 12..=1 << 16).contains(&page_size) {
        return Err(Error::Corruption("implausible page size in header"));
    }
    Ok(page_size)
}
