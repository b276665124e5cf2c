//! A cursor over the pending-transaction op-tree. Positions are
//! (key, op) pairs; the status surface (`KeyErasedInTxn`, `TxnConflict`,
//! `KeyNotFound`) drives the hybrid cursor's merge decisions.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::DupePosition;
use crate::btree::cursor::CursorMove;
use crate::btree::{Approx, FindMatch};
use crate::error::{Error, Result};

use super::{OpKind, Probe, TxnIndex, TxnOp};

pub struct TxnCursor {
    index: Arc<TxnIndex>,
    txn_id: Option<u64>,
    pos: Mutex<Option<(Vec<u8>, Arc<TxnOp>)>>,
}

impl TxnCursor {
    pub(crate) fn new(index: Arc<TxnIndex>, txn_id: Option<u64>) -> Self {
        Self {
            index,
            txn_id,
            pos: Mutex::new(None),
        }
    }

    pub(crate) fn clone_cursor(&self) -> Self {
        Self {
            index: self.index.clone(),
            txn_id: self.txn_id,
            pos: Mutex::new(self.pos.lock().clone()),
        }
    }

    pub fn txn_id(&self) -> Option<u64> {
        self.txn_id
    }

    pub fn is_nil(&self) -> bool {
        self.pos.lock().is_none()
    }

    pub fn set_nil(&self) {
        *self.pos.lock() = None;
    }

    pub(crate) fn coupled_op(&self) -> Option<(Vec<u8>, Arc<TxnOp>)> {
        self.pos.lock().clone()
    }

    pub(crate) fn couple_to_op(&self, key: Vec<u8>, op: Arc<TxnOp>) {
        *self.pos.lock() = Some((key, op));
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        self.pos
            .lock()
            .as_ref()
            .map(|(key, _)| key.clone())
            .ok_or(Error::CursorIsNil)
    }

    pub fn record(&self) -> Result<Vec<u8>> {
        let guard = self.pos.lock();
        let (_, op) = guard.as_ref().ok_or(Error::CursorIsNil)?;
        if op.is_erase() {
            return Err(Error::KeyErasedInTxn);
        }
        Ok(op.record())
    }

    fn couple_from_probe(&self, key: Vec<u8>, probe: Probe) -> Result<()> {
        match probe {
            Probe::Insert(op) => {
                self.couple_to_op(key, op);
                Ok(())
            }
            Probe::Erased(op) => {
                self.couple_to_op(key, op);
                Err(Error::KeyErasedInTxn)
            }
            Probe::Conflict(op) => {
                self.couple_to_op(key, op);
                Err(Error::TxnConflict)
            }
            Probe::None => {
                self.set_nil();
                Err(Error::KeyNotFound)
            }
        }
    }

    pub fn move_op(&self, op: CursorMove) -> Result<()> {
        let op = if self.is_nil() {
            match op {
                CursorMove::Next => CursorMove::First,
                CursorMove::Previous => CursorMove::Last,
                other => other,
            }
        } else {
            op
        };
        let scanned = match op {
            CursorMove::First => self.index.scan(Bound::Unbounded, true, self.txn_id),
            CursorMove::Last => self.index.scan(Bound::Unbounded, false, self.txn_id),
            CursorMove::Next => {
                let key = self.key()?;
                self.index.scan(Bound::Excluded(&key[..]), true, self.txn_id)
            }
            CursorMove::Previous => {
                let key = self.key()?;
                self.index
                    .scan(Bound::Excluded(&key[..]), false, self.txn_id)
            }
        };
        match scanned {
            Some((key, probe)) => self.couple_from_probe(key, probe),
            None => {
                self.set_nil();
                Err(Error::KeyNotFound)
            }
        }
    }

    pub fn find(&self, key: &[u8], approx: Approx) -> Result<FindMatch> {
        match self.index.probe(key, self.txn_id) {
            Probe::None => {}
            probe => {
                self.couple_from_probe(key.to_vec(), probe)?;
                return Ok(FindMatch::Exact);
            }
        }
        let scanned = match approx {
            Approx::Exact => None,
            Approx::Geq => self.index.scan(Bound::Included(key), true, self.txn_id),
            Approx::Leq => self.index.scan(Bound::Included(key), false, self.txn_id),
        };
        match scanned {
            Some((key, probe)) => {
                self.couple_from_probe(key, probe)?;
                Ok(FindMatch::Approximate)
            }
            None => {
                self.set_nil();
                Err(Error::KeyNotFound)
            }
        }
    }

    fn require_txn(&self) -> Result<u64> {
        self.txn_id
            .ok_or(Error::InvalidParameter("operation requires a transaction"))
    }

    /// Appends an erase op for `key` and couples to it. A non-zero
    /// `referenced_dupe` (1-based) erases only that duplicate.
    pub fn erase_key(&self, key: &[u8], referenced_dupe: u32) -> Result<()> {
        let txn = self.require_txn()?;
        let op = self.index.append(
            txn,
            key,
            OpKind::Erase,
            DupePosition::Last,
            referenced_dupe,
            Vec::new(),
        )?;
        self.couple_to_op(key.to_vec(), op);
        Ok(())
    }

    /// Appends an insert-overwrite op for `key` and couples to it.
    pub fn insert_overwrite(&self, key: &[u8], record: &[u8]) -> Result<()> {
        let txn = self.require_txn()?;
        let op = self.index.append(
            txn,
            key,
            OpKind::InsertOverwrite,
            DupePosition::Last,
            0,
            record.to_vec(),
        )?;
        self.couple_to_op(key.to_vec(), op);
        Ok(())
    }

    /// Rewrites the coupled op's record in place when it belongs to our
    /// transaction; otherwise appends a fresh overwrite op.
    pub fn overwrite(&self, record: &[u8]) -> Result<()> {
        let txn = self.require_txn()?;
        let Some((key, op)) = self.coupled_op() else {
            return Err(Error::CursorIsNil);
        };
        if op.txn_id == txn && !op.is_erase() {
            *op.record.lock() = record.to_vec();
            return Ok(());
        }
        self.insert_overwrite(&key, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnRegistry;

    fn cursor_with_ops() -> (TxnCursor, Arc<TxnIndex>, u64) {
        let registry = Arc::new(TxnRegistry::new());
        let index = Arc::new(TxnIndex::new(registry.clone()));
        let txn = registry.begin();
        for key in [b"alpha".as_ref(), b"beta".as_ref(), b"delta".as_ref()] {
            index
                .append(
                    txn,
                    key,
                    OpKind::Insert,
                    DupePosition::Last,
                    0,
                    key.to_vec(),
                )
                .unwrap();
        }
        (TxnCursor::new(index.clone(), Some(txn)), index, txn)
    }

    #[test]
    fn walks_keys_in_order() {
        let (cursor, _, _) = cursor_with_ops();
        cursor.move_op(CursorMove::First).unwrap();
        assert_eq!(cursor.key().unwrap(), b"alpha");
        cursor.move_op(CursorMove::Next).unwrap();
        assert_eq!(cursor.key().unwrap(), b"beta");
        cursor.move_op(CursorMove::Next).unwrap();
        assert_eq!(cursor.key().unwrap(), b"delta");
        assert!(matches!(
            cursor.move_op(CursorMove::Next),
            Err(Error::KeyNotFound)
        ));
        assert!(cursor.is_nil());
    }

    #[test]
    fn nil_next_behaves_as_first() {
        let (cursor, _, _) = cursor_with_ops();
        cursor.move_op(CursorMove::Next).unwrap();
        assert_eq!(cursor.key().unwrap(), b"alpha");
    }

    #[test]
    fn approximate_find_lands_on_the_neighbor() {
        let (cursor, _, _) = cursor_with_ops();
        let matched = cursor.find(b"carrot", Approx::Geq).unwrap();
        assert_eq!(matched, FindMatch::Approximate);
        assert_eq!(cursor.key().unwrap(), b"delta");
        let matched = cursor.find(b"carrot", Approx::Leq).unwrap();
        assert_eq!(matched, FindMatch::Approximate);
        assert_eq!(cursor.key().unwrap(), b"beta");
    }

    #[test]
    fn erased_key_reports_its_status() {
        let (cursor, _, _) = cursor_with_ops();
        cursor.find(b"beta", Approx::Exact).unwrap();
        cursor.erase_key(b"beta", 0).unwrap();
        assert!(matches!(
            cursor.find(b"beta", Approx::Exact),
            Err(Error::KeyErasedInTxn)
        ));
        assert!(!cursor.is_nil());
    }

    #[test]
    fn overwrite_in_place_rewrites_the_op() {
        let (cursor, index, txn) = cursor_with_ops();
        cursor.find(b"alpha", Approx::Exact).unwrap();
        cursor.overwrite(b"fresh").unwrap();
        match index.probe(b"alpha", Some(txn)) {
            super::Probe::Insert(op) => assert_eq!(op.record(), b"fresh"),
            _ => panic!("expected insert probe"),
        }
        assert_eq!(cursor.record().unwrap(), b"fresh");
    }
}
