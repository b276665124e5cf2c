//! The unit of disk I/O: a fixed-size buffer identified by its file offset,
//! plus the bookkeeping the page manager and the cursors hang off it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::btree::cursor::BtreeCursorInner;
use crate::device::Device;
use crate::error::{Error, Result};

/// Bytes reserved at the start of every page that carries a header. Blob
/// continuation pages are raw and skip it entirely.
pub const PAGE_HDR_LEN: usize = 16;

const KIND_OFFSET: usize = 0;
const LSN_OFFSET: usize = 8;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageKind {
    Header = 0,
    Index = 1,
    Leaf = 2,
    PageManagerState = 3,
    Blob = 4,
}

impl PageKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Header),
            1 => Ok(PageKind::Index),
            2 => Ok(PageKind::Leaf),
            3 => Ok(PageKind::PageManagerState),
            4 => Ok(PageKind::Blob),
            _ => Err(Error::Corruption("unknown page kind")),
        }
    }
}

struct PageMeta {
    kind: PageKind,
    dirty: bool,
    without_header: bool,
    db: Option<u16>,
}

/// A resident page. Owned by the page cache (or by the page manager's
/// state-page slot); cursors referencing it are tracked in `cursors` so the
/// cache can refuse to evict a page that is still coupled.
pub struct Page {
    address: u64,
    data: RwLock<Box<[u8]>>,
    meta: Mutex<PageMeta>,
    cursors: Mutex<HashMap<u64, Weak<Mutex<BtreeCursorInner>>>>,
}

impl Page {
    pub fn new(address: u64, page_size: usize) -> Self {
        Self {
            address,
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            meta: Mutex::new(PageMeta {
                kind: PageKind::Blob,
                dirty: false,
                without_header: false,
                db: None,
            }),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn page_size(&self) -> usize {
        self.data.read().len()
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn kind(&self) -> PageKind {
        self.meta.lock().kind
    }

    /// Sets the in-memory kind and mirrors it into the persisted header
    /// byte (unless the page is headerless).
    pub fn set_kind(&self, kind: PageKind) {
        let mut meta = self.meta.lock();
        meta.kind = kind;
        if !meta.without_header {
            self.data.write()[KIND_OFFSET] = kind as u8;
        }
    }

    pub fn dirty(&self) -> bool {
        self.meta.lock().dirty
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.meta.lock().dirty = dirty;
    }

    pub fn without_header(&self) -> bool {
        self.meta.lock().without_header
    }

    pub fn set_without_header(&self, without_header: bool) {
        let mut meta = self.meta.lock();
        meta.without_header = without_header;
        if without_header {
            meta.kind = PageKind::Blob;
        }
    }

    pub fn db(&self) -> Option<u16> {
        self.meta.lock().db
    }

    pub fn set_db(&self, db: Option<u16>) {
        self.meta.lock().db = db;
    }

    pub fn lsn(&self) -> u64 {
        if self.without_header() {
            return 0;
        }
        let data = self.data.read();
        u64::from_le_bytes(data[LSN_OFFSET..LSN_OFFSET + 8].try_into().unwrap())
    }

    pub fn set_lsn(&self, lsn: u64) {
        if self.without_header() {
            return;
        }
        let mut data = self.data.write();
        data[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Reads the page from the device and decodes the persisted header.
    /// An unrecognized kind byte is left as `Blob`; pages freed and reused
    /// carry arbitrary bytes, so the check belongs to the consumer.
    pub fn read_from(&self, device: &mut dyn Device) -> Result<()> {
        {
            let mut data = self.data.write();
            device.read_at(self.address, &mut data[..])?;
        }
        let mut meta = self.meta.lock();
        if !meta.without_header {
            meta.kind =
                PageKind::from_u8(self.data.read()[KIND_OFFSET]).unwrap_or(PageKind::Blob);
        }
        meta.dirty = false;
        Ok(())
    }

    /// Writes the page back if it is dirty.
    pub fn flush(&self, device: &mut dyn Device) -> Result<()> {
        let mut meta = self.meta.lock();
        if !meta.dirty {
            return Ok(());
        }
        let data = self.data.read();
        device.write_at(self.address, &data[..])?;
        meta.dirty = false;
        Ok(())
    }

    pub(crate) fn add_cursor(&self, id: u64, cursor: Weak<Mutex<BtreeCursorInner>>) {
        self.cursors.lock().insert(id, cursor);
    }

    pub(crate) fn remove_cursor(&self, id: u64) {
        self.cursors.lock().remove(&id);
    }

    /// Number of live coupled cursors. Dead weak handles are pruned on the
    /// way, so the count drives the "may this page be evicted" check.
    pub fn cursor_count(&self) -> usize {
        let mut cursors = self.cursors.lock();
        cursors.retain(|_, weak| weak.strong_count() > 0);
        cursors.len()
    }

    pub(crate) fn coupled_cursors(&self) -> Vec<Arc<Mutex<BtreeCursorInner>>> {
        self.cursors
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("Page")
            .field("address", &self.address)
            .field("kind", &meta.kind)
            .field("dirty", &meta.dirty)
            .field("without_header", &meta.without_header)
            .finish()
    }
}
