//! B-tree cursors: an iterator over leaf slots that is either *coupled*
//! to a (page, slot) position or *uncoupled* and holding its key, able to
//! re-find its position after the page went away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::node::{Node, KEY_HAS_DUPLICATES};
use crate::btree::{Approx, BTree, FindMatch, InsertFlags};
use crate::error::{Error, Result};
use crate::page::{Page, PageKind, PAGE_HDR_LEN};

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Movement requests understood by every cursor flavor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
}

pub(crate) enum CursorState {
    Nil,
    Coupled { page: Arc<Page>, slot: usize },
    Uncoupled { key: Vec<u8> },
}

/// The shared part of a cursor; pages keep weak handles to it so eviction
/// and structural changes can uncouple every affected cursor.
pub struct BtreeCursorInner {
    id: u64,
    state: CursorState,
    dupe_id: u32,
}

impl BtreeCursorInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn coupled(&self) -> Option<(Arc<Page>, usize)> {
        match &self.state {
            CursorState::Coupled { page, slot } => Some((page.clone(), *slot)),
            _ => None,
        }
    }

    /// Converts a coupled cursor into an uncoupled one holding `key`. The
    /// caller removes the registration from the page.
    pub(crate) fn set_uncoupled(&mut self, key: Vec<u8>) {
        self.state = CursorState::Uncoupled { key };
    }
}

pub struct BtreeCursor {
    btree: Arc<BTree>,
    inner: Arc<Mutex<BtreeCursorInner>>,
}

impl BtreeCursor {
    pub fn new(btree: Arc<BTree>) -> Self {
        Self {
            btree,
            inner: Arc::new(Mutex::new(BtreeCursorInner {
                id: NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed),
                state: CursorState::Nil,
                dupe_id: 0,
            })),
        }
    }

    pub fn clone_cursor(&self) -> Self {
        let fresh = Self::new(self.btree.clone());
        let guard = self.inner.lock();
        match &guard.state {
            CursorState::Nil => {}
            CursorState::Coupled { page, slot } => {
                let page = page.clone();
                let slot = *slot;
                let dupe_id = guard.dupe_id;
                drop(guard);
                fresh.couple_to(page, slot);
                fresh.inner.lock().dupe_id = dupe_id;
                return fresh;
            }
            CursorState::Uncoupled { key } => {
                let mut fresh_guard = fresh.inner.lock();
                fresh_guard.state = CursorState::Uncoupled { key: key.clone() };
                fresh_guard.dupe_id = guard.dupe_id;
            }
        }
        fresh
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.inner.lock().state, CursorState::Nil)
    }

    pub fn is_coupled(&self) -> bool {
        matches!(self.inner.lock().state, CursorState::Coupled { .. })
    }

    pub fn is_uncoupled(&self) -> bool {
        matches!(self.inner.lock().state, CursorState::Uncoupled { .. })
    }

    pub fn dupe_id(&self) -> u32 {
        self.inner.lock().dupe_id
    }

    pub fn set_dupe_id(&self, dupe_id: u32) {
        self.inner.lock().dupe_id = dupe_id;
    }

    /// Drops any position: unlinks from the page's cursor list and frees
    /// the cached key.
    pub fn set_nil(&self) {
        let mut guard = self.inner.lock();
        if let CursorState::Coupled { page, .. } = &guard.state {
            page.remove_cursor(guard.id);
        }
        guard.state = CursorState::Nil;
        guard.dupe_id = 0;
    }

    /// Couples to a concrete leaf position and registers with the page.
    pub(crate) fn couple_to(&self, page: Arc<Page>, slot: usize) {
        debug_assert_eq!(page.kind(), PageKind::Leaf);
        self.set_nil();
        let mut guard = self.inner.lock();
        page.add_cursor(guard.id, Arc::downgrade(&self.inner));
        guard.state = CursorState::Coupled { page, slot };
        guard.dupe_id = 0;
    }

    pub(crate) fn coupled(&self) -> Option<(Arc<Page>, usize)> {
        self.inner.lock().coupled()
    }

    /// Deep-copies the current key and releases the page.
    pub fn uncouple(&self) -> Result<()> {
        let Some((page, slot)) = self.coupled() else {
            return Ok(());
        };
        let key = self.btree.full_key_at(&page, slot)?;
        let mut guard = self.inner.lock();
        if matches!(guard.state, CursorState::Coupled { .. }) {
            page.remove_cursor(guard.id);
            guard.state = CursorState::Uncoupled { key };
        }
        Ok(())
    }

    /// Re-couples an uncoupled cursor by finding its cached key again.
    pub fn couple(&self) -> Result<()> {
        let key = {
            let guard = self.inner.lock();
            match &guard.state {
                CursorState::Uncoupled { key } => key.clone(),
                CursorState::Coupled { .. } => return Ok(()),
                CursorState::Nil => return Err(Error::CursorIsNil),
            }
        };
        self.find(&key, Approx::Exact).map(|_| ())
    }

    pub fn find(&self, key: &[u8], approx: Approx) -> Result<FindMatch> {
        self.btree.find_cursor(self, key, approx)
    }

    pub fn move_op(&self, op: CursorMove) -> Result<()> {
        // NEXT on a Nil cursor behaves as FIRST, PREVIOUS as LAST.
        let op = if self.is_nil() {
            match op {
                CursorMove::Next => CursorMove::First,
                CursorMove::Previous => CursorMove::Last,
                other => other,
            }
        } else {
            op
        };
        match op {
            CursorMove::First => self.move_first(),
            CursorMove::Last => self.move_last(),
            CursorMove::Next => self.move_adjacent(true),
            CursorMove::Previous => self.move_adjacent(false),
        }
    }

    fn move_first(&self) -> Result<()> {
        self.set_nil();
        let root = self.btree.root();
        if root == 0 {
            return Err(Error::KeyNotFound);
        }
        let mut page = self.btree.fetch_node_page(root)?;
        loop {
            if self.btree.node_count(&page) == 0 && page.kind() == PageKind::Index {
                return Err(Error::KeyNotFound);
            }
            if page.kind() == PageKind::Leaf {
                break;
            }
            let child = {
                let data = page.data();
                Node::new(&data[PAGE_HDR_LEN..], self.btree.key_size()).ptr_left()
            };
            page = self.btree.fetch_node_page(child)?;
        }
        // Skip over leaves drained by erases.
        while self.btree.node_count(&page) == 0 {
            let right = self.btree.node_right(&page);
            if right == 0 {
                return Err(Error::KeyNotFound);
            }
            page = self.btree.fetch_node_page(right)?;
        }
        self.couple_to(page, 0);
        Ok(())
    }

    fn move_last(&self) -> Result<()> {
        self.set_nil();
        let root = self.btree.root();
        if root == 0 {
            return Err(Error::KeyNotFound);
        }
        let mut page = self.btree.fetch_node_page(root)?;
        loop {
            let count = self.btree.node_count(&page);
            if count == 0 && page.kind() == PageKind::Index {
                return Err(Error::KeyNotFound);
            }
            if page.kind() == PageKind::Leaf {
                break;
            }
            let child = {
                let data = page.data();
                Node::new(&data[PAGE_HDR_LEN..], self.btree.key_size()).rid(count - 1)
            };
            page = self.btree.fetch_node_page(child)?;
        }
        while self.btree.node_count(&page) == 0 {
            let left = self.btree.node_left(&page);
            if left == 0 {
                return Err(Error::KeyNotFound);
            }
            page = self.btree.fetch_node_page(left)?;
        }
        let count = self.btree.node_count(&page);
        self.couple_to(page, count - 1);
        Ok(())
    }

    fn move_adjacent(&self, forward: bool) -> Result<()> {
        let cached_key = {
            let guard = self.inner.lock();
            match &guard.state {
                CursorState::Uncoupled { key } => Some(key.clone()),
                _ => None,
            }
        };
        if let Some(key) = cached_key {
            // Re-finding the cached key with approximate matching keeps the
            // walk correct when the key itself was erased meanwhile: an
            // approximate hit already is the adjacent entry.
            let approx = if forward { Approx::Geq } else { Approx::Leq };
            if self.find(&key, approx)? == FindMatch::Approximate {
                return Ok(());
            }
        }
        let Some((page, slot)) = self.coupled() else {
            return Err(Error::CursorIsNil);
        };
        if forward {
            if slot + 1 < self.btree.node_count(&page) {
                self.couple_to(page, slot + 1);
                return Ok(());
            }
            let mut page = page;
            loop {
                let right = self.btree.node_right(&page);
                if right == 0 {
                    self.set_nil();
                    return Err(Error::KeyNotFound);
                }
                page = self.btree.fetch_node_page(right)?;
                if self.btree.node_count(&page) > 0 {
                    self.couple_to(page, 0);
                    return Ok(());
                }
            }
        } else {
            if slot > 0 {
                self.couple_to(page, slot - 1);
                return Ok(());
            }
            let mut page = page;
            loop {
                let left = self.btree.node_left(&page);
                if left == 0 {
                    self.set_nil();
                    return Err(Error::KeyNotFound);
                }
                page = self.btree.fetch_node_page(left)?;
                let count = self.btree.node_count(&page);
                if count > 0 {
                    self.couple_to(page, count - 1);
                    return Ok(());
                }
            }
        }
    }

    pub fn read_key(&self) -> Result<Vec<u8>> {
        let guard = self.inner.lock();
        match &guard.state {
            CursorState::Nil => Err(Error::CursorIsNil),
            CursorState::Uncoupled { key } => Ok(key.clone()),
            CursorState::Coupled { page, slot } => {
                let (page, slot) = (page.clone(), *slot);
                drop(guard);
                self.btree.full_key_at(&page, slot)
            }
        }
    }

    pub fn read_record(&self) -> Result<Vec<u8>> {
        if self.is_uncoupled() {
            self.couple()?;
        }
        let Some((page, slot)) = self.coupled() else {
            return Err(Error::CursorIsNil);
        };
        let dupe_id = self.dupe_id();
        self.btree.slot_record(&page, slot, dupe_id)
    }

    /// Rewrites the record under the cursor, switching representations as
    /// needed. With duplicates, only the current duplicate is replaced.
    pub fn replace(&self, record: &[u8]) -> Result<()> {
        if self.is_uncoupled() {
            self.couple()?;
        }
        let Some((page, slot)) = self.coupled() else {
            return Err(Error::CursorIsNil);
        };
        let has_dupes = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.btree.key_size());
            node.flags(slot) & KEY_HAS_DUPLICATES != 0
        };
        if has_dupes {
            let reference = self.dupe_id() + 1;
            self.btree.set_slot_record(
                &page,
                slot,
                record,
                InsertFlags::OVERWRITE,
                reference,
            )?;
        } else {
            self.btree
                .set_slot_record(&page, slot, record, InsertFlags::OVERWRITE, 0)?;
        }
        Ok(())
    }

    /// Erases the current duplicate (or the whole key when there are no
    /// duplicates). The cursor ends uncoupled, still holding the erased
    /// key, so a following NEXT lands on the successor.
    pub fn erase(&self) -> Result<()> {
        if self.is_uncoupled() {
            self.couple()?;
        }
        let Some((page, slot)) = self.coupled() else {
            return Err(Error::CursorIsNil);
        };
        let key = self.btree.full_key_at(&page, slot)?;
        let has_dupes = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.btree.key_size());
            node.flags(slot) & KEY_HAS_DUPLICATES != 0
        };
        let dupe = has_dupes.then(|| self.dupe_id());
        drop(page);
        // erase_entry uncouples every cursor on the leaf, us included.
        self.btree.erase_entry(&key, dupe)?;
        let mut guard = self.inner.lock();
        if let Some((page, _)) = guard.coupled() {
            page.remove_cursor(guard.id);
        }
        guard.set_uncoupled(key);
        guard.dupe_id = 0;
        Ok(())
    }

    /// Inserts through the cursor; on success the cursor is coupled to the
    /// new entry.
    pub fn insert(
        &self,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dupe_reference: u32,
    ) -> Result<()> {
        self.set_nil();
        let (page, slot) = self
            .btree
            .insert_entry(key, record, flags, dupe_reference)?;
        self.couple_to(page, slot);
        Ok(())
    }

    pub fn duplicate_count(&self) -> Result<u32> {
        if self.is_uncoupled() {
            self.couple()?;
        }
        let Some((page, slot)) = self.coupled() else {
            return Err(Error::CursorIsNil);
        };
        self.btree.slot_duplicate_count(&page, slot)
    }
}

impl Drop for BtreeCursor {
    fn drop(&mut self) {
        self.set_nil();
    }
}
