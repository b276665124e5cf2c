//! The persistent B-tree: descent, splits, record representation
//! transitions and the cursor-facing find/insert/erase entry points.

pub mod cursor;
pub mod node;

use std::cmp::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::debug;

use crate::blob::{self, DupeEntry, DupePosition};
use crate::error::{Error, Result};
use crate::extkey::ExtKeyCache;
use crate::header::HeaderPage;
use crate::page::{Page, PageKind, PAGE_HDR_LEN};
use crate::page_manager::{PageFlags, PageManager};

use self::cursor::BtreeCursor;
use self::node::{
    record_is_inline, Node, NodeMut, KEY_EXTENDED, KEY_HAS_DUPLICATES, RECORD_EMPTY,
    RECORD_SMALL, RECORD_TINY,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct InsertFlags: u32 {
        /// Replace the record when the key already exists.
        const OVERWRITE = 1 << 0;
        /// Add another record under the key.
        const DUPLICATE = 1 << 1;
        const DUPLICATE_FIRST = 1 << 2;
        const DUPLICATE_BEFORE = 1 << 3;
        const DUPLICATE_AFTER = 1 << 4;
        const DUPLICATE_LAST = 1 << 5;
    }
}

impl InsertFlags {
    pub fn any_duplicate(self) -> bool {
        self.intersects(
            InsertFlags::DUPLICATE
                | InsertFlags::DUPLICATE_FIRST
                | InsertFlags::DUPLICATE_BEFORE
                | InsertFlags::DUPLICATE_AFTER
                | InsertFlags::DUPLICATE_LAST,
        )
    }

    /// 0-based placement for the duplicate table; `reference` is the
    /// caller's 1-based duplicate index.
    pub(crate) fn dupe_position(self, reference: u32) -> DupePosition {
        if self.contains(InsertFlags::DUPLICATE_FIRST) {
            DupePosition::First
        } else if self.contains(InsertFlags::DUPLICATE_BEFORE) {
            DupePosition::Before(reference.saturating_sub(1))
        } else if self.contains(InsertFlags::DUPLICATE_AFTER) {
            DupePosition::After(reference.saturating_sub(1))
        } else {
            DupePosition::Last
        }
    }
}

/// Approximate-match mode for [`BTree::find_cursor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Approx {
    Exact,
    /// Smallest key greater than or equal to the needle.
    Geq,
    /// Greatest key less than or equal to the needle.
    Leq,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindMatch {
    Exact,
    Approximate,
}

pub struct BTree {
    pm: Arc<PageManager>,
    header: Arc<HeaderPage>,
    extkeys: ExtKeyCache,
    db_id: u16,
    desc_slot: usize,
    key_size: usize,
    duplicates: bool,
    root: Mutex<u64>,
}

impl BTree {
    /// Opens the tree described by header descriptor `desc_slot`.
    pub fn open(pm: Arc<PageManager>, header: Arc<HeaderPage>, desc_slot: usize) -> Self {
        let descriptor = header.descriptor(desc_slot);
        Self {
            pm,
            header,
            extkeys: ExtKeyCache::new(),
            db_id: descriptor.name,
            desc_slot,
            key_size: descriptor.key_size as usize,
            duplicates: descriptor.duplicates(),
            root: Mutex::new(descriptor.root),
        }
    }

    pub(crate) fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn duplicates_enabled(&self) -> bool {
        self.duplicates
    }

    pub fn root(&self) -> u64 {
        *self.root.lock()
    }

    fn set_root(&self, address: u64) {
        *self.root.lock() = address;
        let mut descriptor = self.header.descriptor(self.desc_slot);
        descriptor.root = address;
        self.header.set_descriptor(self.desc_slot, &descriptor);
    }

    pub(crate) fn fetch_node_page(&self, address: u64) -> Result<Arc<Page>> {
        let page = self.pm.fetch(Some(self.db_id), address, PageFlags::empty())?;
        match page.kind() {
            PageKind::Index | PageKind::Leaf => Ok(page),
            _ => Err(Error::Corruption("expected a btree page")),
        }
    }

    /// Reassembles the full key of a slot, going through the extended-key
    /// cache for spilled keys.
    pub(crate) fn full_key_at(&self, page: &Page, index: usize) -> Result<Vec<u8>> {
        let (prefix, key_len, spill) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            let spill = if node.flags(index) & KEY_EXTENDED != 0 {
                Some(node.extended_rid(index))
            } else {
                None
            };
            (node.key_prefix(index).to_vec(), node.key_len(index), spill)
        };
        let Some(blob_id) = spill else {
            return Ok(prefix);
        };
        if let Some(key) = self.extkeys.fetch(blob_id) {
            return Ok(key);
        }
        let tail = blob::read(&self.pm, blob_id)?;
        let mut full = prefix;
        full.extend_from_slice(&tail);
        if full.len() != key_len {
            return Err(Error::Corruption("extended key length mismatch"));
        }
        self.extkeys.insert(blob_id, full.clone());
        Ok(full)
    }

    /// Orders the slot key at `index` relative to `needle`, touching the
    /// spill blob only when the inline prefix cannot decide.
    fn compare_slot(&self, page: &Page, index: usize, needle: &[u8]) -> Result<Ordering> {
        let decided = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            let prefix = node.key_prefix(index);
            if node.flags(index) & KEY_EXTENDED == 0 {
                Some(prefix.cmp(needle))
            } else {
                let shared = prefix.len().min(needle.len());
                match prefix[..shared].cmp(&needle[..shared]) {
                    Ordering::Equal if needle.len() <= prefix.len() => Some(Ordering::Greater),
                    Ordering::Equal => None,
                    decided => Some(decided),
                }
            }
        };
        if let Some(order) = decided {
            return Ok(order);
        }
        let full = self.full_key_at(page, index)?;
        Ok(full.as_slice().cmp(needle))
    }

    /// Binary search inside one node: `Ok(slot)` on an exact hit,
    /// `Err(insert_position)` otherwise.
    pub(crate) fn search_node(&self, page: &Page, needle: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let count = {
            let data = page.data();
            Node::new(&data[PAGE_HDR_LEN..], self.key_size).count()
        };
        let mut low = 0;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            match self.compare_slot(page, mid, needle)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// Walks from the root to the leaf whose range covers `needle`.
    pub(crate) fn find_leaf(&self, needle: &[u8]) -> Result<Arc<Page>> {
        let root = self.root();
        if root == 0 {
            return Err(Error::KeyNotFound);
        }
        let mut page = self.fetch_node_page(root)?;
        while page.kind() == PageKind::Index {
            let child = {
                let slot = self.search_node(&page, needle)?;
                let data = page.data();
                let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
                match slot {
                    Ok(index) => node.rid(index),
                    Err(0) => node.ptr_left(),
                    Err(position) => node.rid(position - 1),
                }
            };
            page = self.fetch_node_page(child)?;
        }
        Ok(page)
    }

    /// Positions `cursor` on `key`. With `Geq`/`Leq` the nearest slot in
    /// the requested direction is taken, possibly in a sibling leaf.
    pub(crate) fn find_cursor(
        &self,
        cursor: &BtreeCursor,
        key: &[u8],
        approx: Approx,
    ) -> Result<FindMatch> {
        cursor.set_nil();
        let leaf = self.find_leaf(key)?;
        match self.search_node(&leaf, key)? {
            Ok(index) => {
                cursor.couple_to(leaf, index);
                Ok(FindMatch::Exact)
            }
            Err(position) => match approx {
                Approx::Exact => Err(Error::KeyNotFound),
                Approx::Geq => {
                    let count = self.node_count(&leaf);
                    if position < count {
                        cursor.couple_to(leaf, position);
                        return Ok(FindMatch::Approximate);
                    }
                    let mut page = leaf;
                    loop {
                        let right = self.node_right(&page);
                        if right == 0 {
                            return Err(Error::KeyNotFound);
                        }
                        page = self.fetch_node_page(right)?;
                        if self.node_count(&page) > 0 {
                            cursor.couple_to(page, 0);
                            return Ok(FindMatch::Approximate);
                        }
                    }
                }
                Approx::Leq => {
                    if position > 0 {
                        cursor.couple_to(leaf, position - 1);
                        return Ok(FindMatch::Approximate);
                    }
                    let mut page = leaf;
                    loop {
                        let left = self.node_left(&page);
                        if left == 0 {
                            return Err(Error::KeyNotFound);
                        }
                        page = self.fetch_node_page(left)?;
                        let count = self.node_count(&page);
                        if count > 0 {
                            cursor.couple_to(page, count - 1);
                            return Ok(FindMatch::Approximate);
                        }
                    }
                }
            },
        }
    }

    pub(crate) fn node_count(&self, page: &Page) -> usize {
        let data = page.data();
        Node::new(&data[PAGE_HDR_LEN..], self.key_size).count()
    }

    pub(crate) fn node_left(&self, page: &Page) -> u64 {
        let data = page.data();
        Node::new(&data[PAGE_HDR_LEN..], self.key_size).left()
    }

    pub(crate) fn node_right(&self, page: &Page) -> u64 {
        let data = page.data();
        Node::new(&data[PAGE_HDR_LEN..], self.key_size).right()
    }

    fn node_is_full(&self, page: &Page) -> bool {
        let data = page.data();
        Node::new(&data[PAGE_HDR_LEN..], self.key_size).is_full()
    }

    /// Uncouples every cursor coupled to `page`, saving its key. Called
    /// before any structural change that moves slots.
    pub(crate) fn uncouple_all_cursors(&self, page: &Arc<Page>) -> Result<()> {
        for inner in page.coupled_cursors() {
            let mut guard = inner.lock();
            let Some((coupled, slot)) = guard.coupled() else {
                continue;
            };
            if coupled.address() != page.address() {
                continue;
            }
            let key = self.full_key_at(page, slot)?;
            let id = guard.id();
            guard.set_uncoupled(key);
            page.remove_cursor(id);
        }
        Ok(())
    }

    /// Inserts `key`/`record`, returning the leaf and slot of the entry.
    pub(crate) fn insert_entry(
        &self,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dupe_reference: u32,
    ) -> Result<(Arc<Page>, usize)> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidParameter("key too long"));
        }
        if flags.any_duplicate() && !self.duplicates {
            return Err(Error::InvalidParameter(
                "duplicates are disabled for this database",
            ));
        }

        let mut page = match self.root() {
            0 => {
                let root = self.pm.alloc(
                    Some(self.db_id),
                    PageKind::Leaf,
                    PageFlags::CLEAR_WITH_ZERO,
                )?;
                self.set_root(root.address());
                root
            }
            root => self.fetch_node_page(root)?,
        };

        // Split a full root up front so the descent always has room for a
        // promoted separator.
        if self.node_is_full(&page) {
            let new_root = self.pm.alloc(
                Some(self.db_id),
                PageKind::Index,
                PageFlags::CLEAR_WITH_ZERO,
            )?;
            {
                let mut data = new_root.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                node.set_ptr_left(page.address());
            }
            new_root.set_dirty(true);
            self.split_child(&new_root, 0, &page)?;
            self.set_root(new_root.address());
            debug!(root = new_root.address(), "btree root split");
            page = new_root;
        }

        while page.kind() == PageKind::Index {
            let (child_address, separator_position) = {
                let slot = self.search_node(&page, key)?;
                let data = page.data();
                let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
                match slot {
                    Ok(index) => (node.rid(index), index + 1),
                    Err(0) => (node.ptr_left(), 0),
                    Err(position) => (node.rid(position - 1), position),
                }
            };
            let child = self.fetch_node_page(child_address)?;
            if self.node_is_full(&child) {
                self.split_child(&page, separator_position, &child)?;
                continue;
            }
            page = child;
        }

        self.uncouple_all_cursors(&page)?;
        let slot = match self.search_node(&page, key)? {
            Ok(index) => {
                if flags.any_duplicate() {
                    self.set_slot_record(&page, index, record, flags, dupe_reference)?;
                } else if flags.contains(InsertFlags::OVERWRITE) {
                    self.set_slot_record(&page, index, record, flags, dupe_reference)?;
                } else {
                    return Err(Error::DuplicateKey);
                }
                index
            }
            Err(position) => {
                let made = self.make_key(key)?;
                {
                    let mut data = page.data_mut();
                    let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                    node.insert_slot(position);
                    node.set_key_len(position, key.len());
                    node.set_flags(position, made.flags);
                    node.set_key_area(position, &made.area);
                }
                page.set_dirty(true);
                self.set_slot_record(&page, position, record, flags, dupe_reference)?;
                position
            }
        };
        Ok((page, slot))
    }

    /// Erases `key` (or one of its duplicates).
    pub(crate) fn erase_entry(&self, key: &[u8], dupe_id: Option<u32>) -> Result<()> {
        let leaf = self.find_leaf(key)?;
        let index = match self.search_node(&leaf, key)? {
            Ok(index) => index,
            Err(_) => return Err(Error::KeyNotFound),
        };
        self.uncouple_all_cursors(&leaf)?;

        let slot_survives = self.erase_slot_record(&leaf, index, dupe_id)?;
        if slot_survives {
            return Ok(());
        }

        let spill = {
            let data = leaf.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            (node.flags(index) & KEY_EXTENDED != 0).then(|| node.extended_rid(index))
        };
        if let Some(blob_id) = spill {
            self.extkeys.remove(blob_id);
            blob::free(&self.pm, blob_id)?;
        }
        {
            let mut data = leaf.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
            node.remove_slot(index);
        }
        leaf.set_dirty(true);
        Ok(())
    }

    /// Splits the full `child`; the separator lands in `parent` at
    /// `position`. All three touched nodes have their cursors uncoupled.
    fn split_child(
        &self,
        parent: &Arc<Page>,
        position: usize,
        child: &Arc<Page>,
    ) -> Result<()> {
        self.uncouple_all_cursors(parent)?;
        self.uncouple_all_cursors(child)?;

        let sibling = self.pm.alloc(
            Some(self.db_id),
            child.kind(),
            PageFlags::CLEAR_WITH_ZERO,
        )?;
        let is_leaf = child.kind() == PageKind::Leaf;
        let count = self.node_count(child);
        let mid = count / 2;

        if is_leaf {
            {
                let mut child_data = child.data_mut();
                let mut sibling_data = sibling.data_mut();
                let mut child_node = NodeMut::new(&mut child_data[PAGE_HDR_LEN..], self.key_size);
                let mut sibling_node =
                    NodeMut::new(&mut sibling_data[PAGE_HDR_LEN..], self.key_size);
                child_node.split_off(mid, &mut sibling_node);
                sibling_node.set_left(child.address());
                sibling_node.set_right(child_node.right());
                child_node.set_right(sibling.address());
            }
            let old_right = {
                let data = sibling.data();
                Node::new(&data[PAGE_HDR_LEN..], self.key_size).right()
            };
            if old_right != 0 {
                let neighbor = self.fetch_node_page(old_right)?;
                let mut data = neighbor.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                node.set_left(sibling.address());
                drop(data);
                neighbor.set_dirty(true);
            }
            // The separator is a fresh copy of the sibling's first key.
            let separator = self.full_key_at(&sibling, 0)?;
            let made = self.make_key(&separator)?;
            {
                let mut data = parent.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                node.insert_slot(position);
                node.set_key_len(position, separator.len());
                node.set_flags(position, made.flags);
                node.set_key_area(position, &made.area);
                node.set_rid(position, sibling.address());
            }
        } else {
            // The middle slot moves up wholesale; its spill blob moves
            // with it instead of being copied.
            let (mid_key_len, mid_flags, mid_rid, mid_area) = {
                let data = child.data();
                let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
                (
                    node.key_len(mid),
                    node.flags(mid),
                    node.rid(mid),
                    node.key_area(mid).to_vec(),
                )
            };
            {
                let mut child_data = child.data_mut();
                let mut sibling_data = sibling.data_mut();
                let mut child_node = NodeMut::new(&mut child_data[PAGE_HDR_LEN..], self.key_size);
                let mut sibling_node =
                    NodeMut::new(&mut sibling_data[PAGE_HDR_LEN..], self.key_size);
                sibling_node.set_ptr_left(mid_rid);
                child_node.split_off(mid + 1, &mut sibling_node);
                child_node.remove_slot(mid);
            }
            {
                let mut data = parent.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                node.insert_slot(position);
                node.set_key_len(position, mid_key_len);
                node.set_flags(position, mid_flags & KEY_EXTENDED);
                node.set_key_area(position, &mid_area);
                node.set_rid(position, sibling.address());
            }
        }
        parent.set_dirty(true);
        child.set_dirty(true);
        sibling.set_dirty(true);
        Ok(())
    }

    fn make_key(&self, key: &[u8]) -> Result<MadeKey> {
        if key.len() <= self.key_size {
            return Ok(MadeKey {
                area: key.to_vec(),
                flags: 0,
            });
        }
        let inline = self.key_size - 8;
        let blob_id = blob::allocate(&self.pm, &key[inline..])?;
        self.extkeys.insert(blob_id, key.to_vec());
        let mut area = key[..inline].to_vec();
        area.extend_from_slice(&blob_id.to_le_bytes());
        Ok(MadeKey {
            area,
            flags: KEY_EXTENDED,
        })
    }

    /// Rewrites the record of a leaf slot, transitioning between the
    /// Empty/Tiny/Small/Big representations and the duplicate table.
    /// Returns the 0-based position of a freshly inserted duplicate.
    pub(crate) fn set_slot_record(
        &self,
        page: &Arc<Page>,
        index: usize,
        record: &[u8],
        flags: InsertFlags,
        dupe_reference: u32,
    ) -> Result<Option<u32>> {
        let (old_flags, old_rid) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            (node.flags(index), node.rid(index))
        };
        let key_bits = old_flags & (KEY_EXTENDED | KEY_HAS_DUPLICATES);
        let has_dupes = old_flags & KEY_HAS_DUPLICATES != 0;
        let old_inline = record_is_inline(old_flags);
        let fresh_slot = old_rid == 0 && !old_inline && !has_dupes;
        let wants_duplicate = flags.any_duplicate();

        let (new_flags, new_rid, inserted_at) = if fresh_slot {
            // First record under the key; a duplicate table only appears
            // once a second record arrives.
            let (bits, rid) = self.encode_record(record)?;
            (key_bits | bits, rid, None)
        } else if has_dupes && flags.contains(InsertFlags::OVERWRITE) && !wants_duplicate
            && dupe_reference == 0
        {
            // An unreferenced overwrite replaces the whole duplicate set.
            blob::duplicate_erase(&self.pm, old_rid, None)?;
            let (bits, rid) = self.encode_record(record)?;
            ((old_flags & KEY_EXTENDED) | bits, rid, None)
        } else if !has_dupes && !wants_duplicate {
            // Plain overwrite of a single record.
            if !old_inline {
                self.extkeys.remove(old_rid);
            }
            if record.len() > 8 {
                let rid = if old_inline {
                    blob::allocate(&self.pm, record)?
                } else {
                    blob::overwrite(&self.pm, old_rid, record)?
                };
                (key_bits, rid, None)
            } else {
                if !old_inline {
                    blob::free(&self.pm, old_rid)?;
                }
                let (bits, rid) = self.encode_record(record)?;
                (key_bits | bits, rid, None)
            }
        } else {
            // The key gains (or already has) a duplicate table.
            let (bits, rid) = self.encode_record(record)?;
            let fresh = DupeEntry {
                flags: bits,
                rid,
            };
            let position = flags.dupe_position(dupe_reference);
            let (table, at) = if has_dupes {
                if flags.contains(InsertFlags::OVERWRITE) && !wants_duplicate {
                    let at = dupe_reference.saturating_sub(1);
                    let old_entry = blob::duplicate_get(&self.pm, old_rid, at)?;
                    if !record_is_inline(old_entry.flags) {
                        blob::free(&self.pm, old_entry.rid)?;
                    }
                    (blob::duplicate_set(&self.pm, old_rid, at, fresh)?, at)
                } else {
                    blob::duplicate_insert(&self.pm, old_rid, &[fresh], position)?
                }
            } else {
                let existing = DupeEntry {
                    flags: old_flags & (RECORD_EMPTY | RECORD_TINY | RECORD_SMALL),
                    rid: old_rid,
                };
                blob::duplicate_insert(&self.pm, 0, &[existing, fresh], position)?
            };
            (
                (old_flags & KEY_EXTENDED) | KEY_HAS_DUPLICATES,
                table,
                Some(at),
            )
        };

        {
            let mut data = page.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
            node.set_flags(index, new_flags);
            node.set_rid(index, new_rid);
        }
        page.set_dirty(true);
        Ok(inserted_at)
    }

    /// Packs a record into its representation bits and rid field,
    /// allocating a blob for anything longer than the rid.
    fn encode_record(&self, record: &[u8]) -> Result<(u8, u64)> {
        if record.is_empty() {
            return Ok((RECORD_EMPTY, 0));
        }
        if record.len() < 8 {
            let mut bytes = [0u8; 8];
            bytes[..record.len()].copy_from_slice(record);
            bytes[7] = record.len() as u8;
            return Ok((RECORD_TINY, u64::from_le_bytes(bytes)));
        }
        if record.len() == 8 {
            return Ok((RECORD_SMALL, u64::from_le_bytes(record.try_into().unwrap())));
        }
        Ok((0, blob::allocate(&self.pm, record)?))
    }

    /// Releases the record storage of a slot (one duplicate or all of it).
    /// Returns true when the slot itself must stay because duplicates
    /// survive.
    fn erase_slot_record(
        &self,
        page: &Arc<Page>,
        index: usize,
        dupe_id: Option<u32>,
    ) -> Result<bool> {
        let (old_flags, old_rid) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            (node.flags(index), node.rid(index))
        };
        if record_is_inline(old_flags) {
            return Ok(false);
        }
        if old_flags & KEY_HAS_DUPLICATES != 0 {
            let table = blob::duplicate_erase(&self.pm, old_rid, dupe_id)?;
            if table != 0 {
                let mut data = page.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HDR_LEN..], self.key_size);
                node.set_rid(index, table);
                drop(data);
                page.set_dirty(true);
                return Ok(true);
            }
            return Ok(false);
        }
        if old_rid != 0 {
            self.extkeys.remove(old_rid);
            blob::free(&self.pm, old_rid)?;
        }
        Ok(false)
    }

    /// Point lookup without a cursor; duplicates yield the first record.
    pub(crate) fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.find_leaf(key)?;
        match self.search_node(&leaf, key)? {
            Ok(index) => self.slot_record(&leaf, index, 0),
            Err(_) => Err(Error::KeyNotFound),
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.find_leaf(key) {
            Ok(leaf) => Ok(self.search_node(&leaf, key)?.is_ok()),
            Err(Error::KeyNotFound) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Number of records stored under the slot (1 without duplicates).
    pub(crate) fn slot_duplicate_count(&self, page: &Page, index: usize) -> Result<u32> {
        let (flags, rid) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            (node.flags(index), node.rid(index))
        };
        if flags & KEY_HAS_DUPLICATES != 0 {
            blob::duplicate_count(&self.pm, rid)
        } else {
            Ok(1)
        }
    }

    /// Materializes the record of a slot; `dupe_id` selects the duplicate.
    pub(crate) fn slot_record(&self, page: &Page, index: usize, dupe_id: u32) -> Result<Vec<u8>> {
        let (flags, rid) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HDR_LEN..], self.key_size);
            (node.flags(index), node.rid(index))
        };
        if flags & KEY_HAS_DUPLICATES != 0 {
            let entry = blob::duplicate_get(&self.pm, rid, dupe_id)?;
            return blob::read_record(&self.pm, entry.flags, entry.rid);
        }
        blob::read_record(&self.pm, flags, rid)
    }
}

struct MadeKey {
    area: Vec<u8>,
    flags: u8,
}
