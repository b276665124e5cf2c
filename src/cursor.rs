//! The hybrid cursor: one B-tree cursor and one transaction cursor walked
//! as a single ordered stream, with a per-key duplicate cache that merges
//! the B-tree's duplicates with the pending transaction ops on that key.

use std::cmp::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::blob::DupePosition;
use crate::btree::cursor::{BtreeCursor, CursorMove};
use crate::btree::{Approx, BTree, FindMatch};
use crate::error::{Error, Result};
use crate::txn::cursor::TxnCursor;
use crate::txn::{OpKind, TxnIndex, TxnOp, TxnState};

/// One line of the duplicate cache: either the i-th B-tree duplicate or a
/// pending transaction op.
#[derive(Clone)]
enum DupeLine {
    Btree(u32),
    Txn(Arc<TxnOp>),
}

#[derive(Default)]
struct DupeCache {
    lines: SmallVec<[DupeLine; 8]>,
}

impl DupeCache {
    fn count(&self) -> u32 {
        self.lines.len() as u32
    }

    fn clear(&mut self) {
        self.lines.clear();
    }

    fn append(&mut self, line: DupeLine) {
        self.lines.push(line);
    }

    fn insert(&mut self, at: usize, line: DupeLine) {
        self.lines.insert(at.min(self.lines.len()), line);
    }

    fn set(&mut self, at: usize, line: DupeLine) {
        self.lines[at] = line;
    }

    fn erase(&mut self, at: usize) {
        self.lines.remove(at);
    }

    fn get(&self, at: usize) -> Option<&DupeLine> {
        self.lines.get(at)
    }
}

/// Which sub-cursor currently carries the hybrid position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    None,
    Btree,
    Txn,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LastOp {
    None,
    Move(CursorMove),
    LookupInsert,
}

/// Position of the transaction side during a merge walk.
enum TxnPos {
    Insert(Vec<u8>),
    Erased(Vec<u8>),
    Conflict(Vec<u8>),
    Exhausted,
}

impl TxnPos {
    fn key(&self) -> Option<&[u8]> {
        match self {
            TxnPos::Insert(key) | TxnPos::Erased(key) | TxnPos::Conflict(key) => Some(key),
            TxnPos::Exhausted => None,
        }
    }
}

pub struct Cursor {
    btree: Arc<BTree>,
    txn_index: Arc<TxnIndex>,
    txn_id: Option<u64>,
    btree_cursor: BtreeCursor,
    txn_cursor: TxnCursor,
    dupecache: DupeCache,
    /// 1-based position inside the dupe cache; 0 when not on a duplicate.
    dupecache_index: u32,
    last_op: LastOp,
    active: Side,
}

impl Cursor {
    pub(crate) fn new(
        btree: Arc<BTree>,
        txn_index: Arc<TxnIndex>,
        txn_id: Option<u64>,
    ) -> Self {
        let btree_cursor = BtreeCursor::new(btree.clone());
        let txn_cursor = TxnCursor::new(txn_index.clone(), txn_id);
        Self {
            btree,
            txn_index,
            txn_id,
            btree_cursor,
            txn_cursor,
            dupecache: DupeCache::default(),
            dupecache_index: 0,
            last_op: LastOp::None,
            active: Side::None,
        }
    }

    pub fn clone_cursor(&self) -> Self {
        Self {
            btree: self.btree.clone(),
            txn_index: self.txn_index.clone(),
            txn_id: self.txn_id,
            btree_cursor: self.btree_cursor.clone_cursor(),
            txn_cursor: self.txn_cursor.clone_cursor(),
            dupecache: DupeCache {
                lines: self.dupecache.lines.clone(),
            },
            dupecache_index: self.dupecache_index,
            last_op: self.last_op,
            active: self.active,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.active == Side::None
            && self.btree_cursor.is_nil()
            && self.txn_cursor.is_nil()
    }

    fn couple_to_btree(&mut self) {
        self.active = Side::Btree;
    }

    fn couple_to_txnop(&mut self) {
        self.active = Side::Txn;
    }

    fn set_to_nil_all(&mut self) {
        self.btree_cursor.set_nil();
        self.txn_cursor.set_nil();
        self.active = Side::None;
        self.clear_dupecache();
    }

    fn clear_dupecache(&mut self) {
        self.dupecache.clear();
        self.dupecache_index = 0;
    }

    fn current_key(&self) -> Result<Vec<u8>> {
        match self.active {
            Side::Txn => self.txn_cursor.key(),
            Side::Btree => self.btree_cursor.read_key(),
            Side::None => self
                .txn_cursor
                .key()
                .or_else(|_| self.btree_cursor.read_key()),
        }
    }

    /// Moves the cursor and returns the key/record it lands on.
    pub fn move_to(
        &mut self,
        op: CursorMove,
        skip_duplicates: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let skip_duplicates = skip_duplicates || !self.btree.duplicates_enabled();

        let op = if self.is_nil() {
            match op {
                CursorMove::Next => CursorMove::First,
                CursorMove::Previous => CursorMove::Last,
                other => other,
            }
        } else {
            op
        };

        // Relative moves after a lookup/insert or a direction change first
        // bring the two sides back into line.
        let changed_dir = matches!(
            (self.last_op, op),
            (LastOp::Move(CursorMove::Previous), CursorMove::Next)
                | (LastOp::Move(CursorMove::Next), CursorMove::Previous)
        );
        if matches!(op, CursorMove::Next | CursorMove::Previous)
            && (self.last_op == LastOp::LookupInsert || changed_dir)
        {
            self.sync(op)?;
        }

        if !skip_duplicates {
            let moved = match op {
                CursorMove::Next => self.move_next_dupe(),
                CursorMove::Previous => self.move_previous_dupe(),
                CursorMove::First => self.move_first_dupe(),
                CursorMove::Last => self.move_last_dupe(),
            };
            match moved {
                Ok(()) => {
                    self.last_op = LastOp::Move(op);
                    return self.retrieve();
                }
                Err(Error::LimitsReached) => {}
                Err(other) => return Err(other),
            }
        }

        // Past the duplicate list (or skipping it): move to the next
        // merged key.
        self.clear_dupecache();
        match op {
            CursorMove::First => self.move_first_key()?,
            CursorMove::Last => self.move_last_key()?,
            CursorMove::Next => self.move_next_key()?,
            CursorMove::Previous => self.move_previous_key()?,
        }

        if !skip_duplicates && self.dupecache.count() > 1 {
            let entered = match op {
                CursorMove::Next | CursorMove::First => self.move_first_dupe(),
                CursorMove::Previous | CursorMove::Last => self.move_last_dupe(),
            };
            if matches!(entered, Err(Error::LimitsReached)) {
                // every duplicate of this key was erased; keep walking
                let follow = match op {
                    CursorMove::First => CursorMove::Next,
                    CursorMove::Last => CursorMove::Previous,
                    other => other,
                };
                return self.move_to(follow, skip_duplicates);
            }
            entered?;
        }

        self.last_op = LastOp::Move(op);
        self.retrieve()
    }

    /// Looks a key up through the overlay, positioning the cursor.
    pub fn find(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.set_to_nil_all();
        self.last_op = LastOp::LookupInsert;
        let duplicates = self.btree.duplicates_enabled();

        match self.txn_cursor.find(key, Approx::Exact) {
            Ok(_) => {
                self.couple_to_txnop();
                if duplicates {
                    let _ = self.btree_cursor.find(key, Approx::Exact);
                    self.update_dupecache(true, true)?;
                    if self.dupecache.count() > 0 {
                        self.couple_to_dupe(1)?;
                    }
                }
                self.retrieve().map(|(_, record)| record)
            }
            Err(Error::KeyErasedInTxn) => {
                // Single records are simply gone; duplicates may survive
                // the partial erases.
                if duplicates {
                    let _ = self.btree_cursor.find(key, Approx::Exact);
                    self.couple_to_txnop();
                    self.update_dupecache(true, true)?;
                    if self.dupecache.count() > 0 {
                        self.couple_to_dupe(1)?;
                        return self.retrieve().map(|(_, record)| record);
                    }
                }
                self.set_to_nil_all();
                Err(Error::KeyNotFound)
            }
            Err(Error::KeyNotFound) => {
                self.btree_cursor.find(key, Approx::Exact)?;
                self.couple_to_btree();
                self.update_dupecache(true, false)?;
                if duplicates && self.dupecache.count() > 0 {
                    self.couple_to_dupe(1)?;
                }
                self.retrieve().map(|(_, record)| record)
            }
            Err(other) => Err(other),
        }
    }

    /// Rewrites the record under the cursor. Inside a transaction this
    /// appends an overwrite op; otherwise the leaf slot is rewritten.
    pub fn overwrite(&mut self, record: &[u8]) -> Result<()> {
        if self.txn_id.is_some() {
            if self.txn_cursor.is_nil() {
                if self.btree_cursor.is_nil() {
                    return Err(Error::CursorIsNil);
                }
                self.btree_cursor.uncouple()?;
                let key = self.btree_cursor.read_key()?;
                self.txn_cursor.insert_overwrite(&key, record)?;
            } else {
                self.txn_cursor.overwrite(record)?;
            }
            self.couple_to_txnop();
        } else {
            self.btree_cursor.replace(record)?;
            self.couple_to_btree();
        }
        Ok(())
    }

    /// Erases the current key (through the transaction when one is
    /// active). The cursor is nil afterwards.
    pub fn erase(&mut self) -> Result<()> {
        if self.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if self.txn_id.is_some() {
            let key = self.current_key()?;
            // When the cursor sits inside the duplicate list, only that
            // duplicate is erased.
            self.txn_cursor.erase_key(&key, self.dupecache_index)?;
            // Keep the erased key latched so a following NEXT resumes at
            // the successor.
            if self.btree_cursor.is_coupled() {
                self.btree_cursor.uncouple()?;
            }
        } else {
            self.btree_cursor.erase()?;
            self.txn_cursor.set_nil();
        }
        self.active = Side::None;
        self.clear_dupecache();
        self.last_op = LastOp::None;
        Ok(())
    }

    /// Number of records under the current key, folding pending ops in.
    pub fn duplicate_count(&mut self) -> Result<u32> {
        if !self.btree.duplicates_enabled() {
            return Ok(if self.is_nil() { 0 } else { 1 });
        }
        if self.is_nil() {
            return Err(Error::CursorIsNil);
        }
        self.update_dupecache(true, true)?;
        Ok(self.dupecache.count())
    }

    /// Saves the current key and releases the underlying page so it can
    /// be evicted.
    pub fn uncouple(&mut self) -> Result<()> {
        self.btree_cursor.uncouple()
    }

    fn retrieve(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.active {
            Side::Txn => {
                let key = self.txn_cursor.key()?;
                let record = self.txn_cursor.record()?;
                Ok((key, record))
            }
            Side::Btree => {
                let key = self.btree_cursor.read_key()?;
                let record = self.btree_cursor.read_record()?;
                Ok((key, record))
            }
            Side::None => Err(Error::CursorIsNil),
        }
    }

    /// Couples the Nil side to the other side's key with approximate
    /// matching in the direction of travel. Returns whether the match was
    /// exact.
    fn sync(&mut self, direction: CursorMove) -> Result<bool> {
        let approx = match direction {
            CursorMove::Previous | CursorMove::Last => Approx::Leq,
            _ => Approx::Geq,
        };
        if self.btree_cursor.is_nil() && !self.txn_cursor.is_nil() {
            let key = self.txn_cursor.key()?;
            match self.btree_cursor.find(&key, approx) {
                Ok(matched) => Ok(matched == FindMatch::Exact),
                Err(Error::KeyNotFound) => Ok(false),
                Err(other) => Err(other),
            }
        } else if self.txn_cursor.is_nil() && !self.btree_cursor.is_nil() {
            let key = self.btree_cursor.read_key()?;
            match self.txn_cursor.find(&key, approx) {
                Ok(matched) => Ok(matched == FindMatch::Exact),
                Err(Error::KeyNotFound) => Ok(false),
                Err(Error::KeyErasedInTxn) | Err(Error::TxnConflict) => {
                    Ok(self.txn_cursor.key()? == key)
                }
                Err(other) => Err(other),
            }
        } else {
            Ok(false)
        }
    }

    /// Equality-only flavor used by the dupe cache: the caller drops the
    /// B-tree position again unless the match was exact.
    fn sync_equal(&mut self) -> Result<bool> {
        self.sync(CursorMove::Previous)
    }

    // --- duplicate cache -------------------------------------------------

    fn update_dupecache(&mut self, use_btree: bool, use_txn: bool) -> Result<()> {
        if !self.btree.duplicates_enabled() {
            return Ok(());
        }
        if self.dupecache.count() != 0 {
            return Ok(());
        }

        if use_btree && use_txn && self.btree_cursor.is_nil() && !self.txn_cursor.is_nil() {
            let equal = self.sync_equal()?;
            if !equal {
                self.btree_cursor.set_nil();
            }
        }

        // B-tree duplicates first; they are already in order.
        if use_btree && !self.btree_cursor.is_nil() {
            let count = self.btree_cursor.duplicate_count()?;
            for index in 0..count {
                self.dupecache.append(DupeLine::Btree(index));
            }
        }

        // Then fold the op chain, oldest to newest.
        if use_txn && !self.txn_cursor.is_nil() {
            let Some((key, _)) = self.txn_cursor.coupled_op() else {
                return Ok(());
            };
            let registry = self.txn_index.registry().clone();
            for op in self.txn_index.op_chain(&key) {
                if registry.state(op.txn_id) == TxnState::Aborted {
                    continue;
                }
                let reference = op.referenced_dupe;
                match op.kind {
                    OpKind::Insert => {
                        self.dupecache.clear();
                        self.dupecache.append(DupeLine::Txn(op));
                    }
                    OpKind::InsertOverwrite => {
                        if reference > 0 && reference <= self.dupecache.count() {
                            self.dupecache
                                .set(reference as usize - 1, DupeLine::Txn(op));
                        } else {
                            self.dupecache.clear();
                            self.dupecache.append(DupeLine::Txn(op));
                        }
                    }
                    OpKind::InsertDuplicate => {
                        let line = DupeLine::Txn(op.clone());
                        let count = self.dupecache.count() as usize;
                        match op.dupe_position {
                            DupePosition::First => self.dupecache.insert(0, line),
                            DupePosition::Before(_) => self
                                .dupecache
                                .insert(reference.saturating_sub(1) as usize, line),
                            DupePosition::After(_) => {
                                if reference as usize >= count {
                                    self.dupecache.append(line);
                                } else {
                                    self.dupecache.insert(reference as usize, line);
                                }
                            }
                            DupePosition::Last => self.dupecache.append(line),
                        }
                    }
                    OpKind::Erase => {
                        if reference > 0 && reference <= self.dupecache.count() {
                            self.dupecache.erase(reference as usize - 1);
                        } else {
                            self.dupecache.clear();
                        }
                    }
                    OpKind::Nop => {}
                }
            }
        }
        Ok(())
    }

    /// Re-positions the active side onto the `dupe_id`-th (1-based) line
    /// of the dupe cache.
    fn couple_to_dupe(&mut self, dupe_id: u32) -> Result<()> {
        debug_assert!(dupe_id >= 1 && dupe_id <= self.dupecache.count());
        let line = self
            .dupecache
            .get(dupe_id as usize - 1)
            .cloned()
            .ok_or(Error::LimitsReached)?;
        match line {
            DupeLine::Btree(index) => {
                self.couple_to_btree();
                self.btree_cursor.set_dupe_id(index);
            }
            DupeLine::Txn(op) => {
                let key = self.current_key()?;
                self.txn_cursor.couple_to_op(key, op);
                self.couple_to_txnop();
            }
        }
        self.dupecache_index = dupe_id;
        Ok(())
    }

    fn move_first_dupe(&mut self) -> Result<()> {
        if self.dupecache.count() > 0 {
            self.couple_to_dupe(1)
        } else {
            Err(Error::LimitsReached)
        }
    }

    fn move_last_dupe(&mut self) -> Result<()> {
        match self.dupecache.count() {
            0 => Err(Error::LimitsReached),
            count => self.couple_to_dupe(count),
        }
    }

    fn move_next_dupe(&mut self) -> Result<()> {
        if self.dupecache_index > 0 && self.dupecache_index < self.dupecache.count() {
            self.couple_to_dupe(self.dupecache_index + 1)
        } else {
            Err(Error::LimitsReached)
        }
    }

    fn move_previous_dupe(&mut self) -> Result<()> {
        if self.dupecache_index > 1 {
            self.couple_to_dupe(self.dupecache_index - 1)
        } else {
            Err(Error::LimitsReached)
        }
    }

    // --- merge walk ------------------------------------------------------

    fn btree_step(&mut self, forward: bool) -> Result<Option<Vec<u8>>> {
        let op = if forward {
            CursorMove::Next
        } else {
            CursorMove::Previous
        };
        match self.btree_cursor.move_op(op) {
            Ok(()) => Ok(Some(self.btree_cursor.read_key()?)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(other) => Err(other),
        }
    }

    fn txn_step(&mut self, forward: bool) -> Result<TxnPos> {
        let op = if forward {
            CursorMove::Next
        } else {
            CursorMove::Previous
        };
        match self.txn_cursor.move_op(op) {
            Ok(()) => Ok(TxnPos::Insert(self.txn_cursor.key()?)),
            Err(Error::KeyErasedInTxn) => Ok(TxnPos::Erased(self.txn_cursor.key()?)),
            Err(Error::TxnConflict) => Ok(TxnPos::Conflict(self.txn_cursor.key()?)),
            Err(Error::KeyNotFound) => Ok(TxnPos::Exhausted),
            Err(other) => Err(other),
        }
    }

    /// Status of the txn side as currently coupled.
    fn txn_current(&self) -> TxnPos {
        let Some((key, op)) = self.txn_cursor.coupled_op() else {
            return TxnPos::Exhausted;
        };
        let registry = self.txn_index.registry();
        match registry.state(op.txn_id) {
            TxnState::Aborted => TxnPos::Exhausted,
            TxnState::Active if self.txn_id != Some(op.txn_id) => TxnPos::Conflict(key),
            _ => {
                if op.is_erase() {
                    TxnPos::Erased(key)
                } else {
                    TxnPos::Insert(key)
                }
            }
        }
    }

    fn move_first_key(&mut self) -> Result<()> {
        let btree_key = match self.btree_cursor.move_op(CursorMove::First) {
            Ok(()) => Some(self.btree_cursor.read_key()?),
            Err(Error::KeyNotFound) => None,
            Err(other) => return Err(other),
        };
        let txn_pos = match self.txn_cursor.move_op(CursorMove::First) {
            Ok(()) => TxnPos::Insert(self.txn_cursor.key()?),
            Err(Error::KeyErasedInTxn) => TxnPos::Erased(self.txn_cursor.key()?),
            Err(Error::TxnConflict) => TxnPos::Conflict(self.txn_cursor.key()?),
            Err(Error::KeyNotFound) => TxnPos::Exhausted,
            Err(other) => return Err(other),
        };
        self.resolve(btree_key, txn_pos, true)
    }

    fn move_last_key(&mut self) -> Result<()> {
        let btree_key = match self.btree_cursor.move_op(CursorMove::Last) {
            Ok(()) => Some(self.btree_cursor.read_key()?),
            Err(Error::KeyNotFound) => None,
            Err(other) => return Err(other),
        };
        let txn_pos = match self.txn_cursor.move_op(CursorMove::Last) {
            Ok(()) => TxnPos::Insert(self.txn_cursor.key()?),
            Err(Error::KeyErasedInTxn) => TxnPos::Erased(self.txn_cursor.key()?),
            Err(Error::TxnConflict) => TxnPos::Conflict(self.txn_cursor.key()?),
            Err(Error::KeyNotFound) => TxnPos::Exhausted,
            Err(other) => return Err(other),
        };
        self.resolve(btree_key, txn_pos, false)
    }

    fn move_next_key(&mut self) -> Result<()> {
        self.move_adjacent_key(true)
    }

    fn move_previous_key(&mut self) -> Result<()> {
        self.move_adjacent_key(false)
    }

    fn move_adjacent_key(&mut self, forward: bool) -> Result<()> {
        let current = self.current_key()?;

        // Bring both sides strictly past the current key.
        let mut btree_key = if self.btree_cursor.is_nil() {
            None
        } else {
            Some(self.btree_cursor.read_key()?)
        };
        while let Some(key) = &btree_key {
            if in_front(key, &current, forward) {
                break;
            }
            btree_key = self.btree_step(forward)?;
        }

        let mut txn_pos = self.txn_current();
        while let Some(key) = txn_pos.key() {
            if in_front(key, &current, forward) {
                break;
            }
            txn_pos = self.txn_step(forward)?;
        }

        self.resolve(btree_key, txn_pos, forward)
    }

    /// The reconciliation loop of the merge walk: picks the side carrying
    /// the next key, skips keys fully erased in the transaction and
    /// propagates conflicts.
    fn resolve(
        &mut self,
        mut btree_key: Option<Vec<u8>>,
        mut txn_pos: TxnPos,
        forward: bool,
    ) -> Result<()> {
        loop {
            match (&btree_key, &txn_pos) {
                (None, TxnPos::Exhausted) => {
                    self.set_to_nil_all();
                    return Err(Error::KeyNotFound);
                }
                (Some(_), TxnPos::Exhausted) => {
                    self.couple_to_btree();
                    self.update_dupecache(true, false)?;
                    return Ok(());
                }
                (None, TxnPos::Conflict(_)) => return Err(Error::TxnConflict),
                (None, TxnPos::Insert(_)) => {
                    self.couple_to_txnop();
                    self.update_dupecache(false, true)?;
                    return Ok(());
                }
                (None, TxnPos::Erased(_)) => {
                    // No B-tree entry behind it, so nothing can survive.
                    txn_pos = self.txn_step(forward)?;
                }
                (Some(bk), txn) => {
                    let tk = txn.key().expect("txn side is positioned");
                    match order(bk, tk, forward) {
                        Ordering::Less => {
                            // The B-tree key comes first; it cannot have
                            // pending ops or the txn side would be on it.
                            self.couple_to_btree();
                            self.update_dupecache(true, false)?;
                            return Ok(());
                        }
                        Ordering::Greater => match txn {
                            TxnPos::Conflict(_) => return Err(Error::TxnConflict),
                            TxnPos::Insert(_) => {
                                self.couple_to_txnop();
                                self.update_dupecache(false, true)?;
                                return Ok(());
                            }
                            TxnPos::Erased(_) => {
                                txn_pos = self.txn_step(forward)?;
                            }
                            TxnPos::Exhausted => unreachable!("key() was Some"),
                        },
                        Ordering::Equal => match txn {
                            TxnPos::Conflict(_) => return Err(Error::TxnConflict),
                            TxnPos::Insert(_) => {
                                // Same key on both sides: the txn op is
                                // newer and wins; duplicates merge.
                                self.couple_to_txnop();
                                self.update_dupecache(true, true)?;
                                return Ok(());
                            }
                            TxnPos::Erased(_) => {
                                if self.btree.duplicates_enabled() {
                                    // Partial erases can leave duplicates
                                    // standing; land on the first survivor.
                                    self.couple_to_txnop();
                                    self.update_dupecache(true, true)?;
                                    let count = self.dupecache.count();
                                    if count > 0 {
                                        self.couple_to_dupe(if forward { 1 } else { count })?;
                                        return Ok(());
                                    }
                                    self.clear_dupecache();
                                }
                                btree_key = self.btree_step(forward)?;
                                txn_pos = self.txn_step(forward)?;
                            }
                            TxnPos::Exhausted => unreachable!("key() was Some"),
                        },
                    }
                }
            }
        }
    }
}

fn order(a: &[u8], b: &[u8], forward: bool) -> Ordering {
    if forward {
        a.cmp(b)
    } else {
        b.cmp(a)
    }
}

/// True when `key` lies strictly beyond `current` in the walk direction.
fn in_front(key: &[u8], current: &[u8], forward: bool) -> bool {
    if forward {
        key > current
    } else {
        key < current
    }
}
