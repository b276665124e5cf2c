//! The in-memory transaction overlay: per-database op-trees holding the
//! uncommitted mutations, and the registry tracking which transactions
//! are still in flight.

pub mod cursor;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::DupePosition;
use crate::error::{Error, Result};

/// A transaction handle. Obtained from `Env::txn_begin`, consumed by
/// commit or abort.
#[derive(Debug)]
pub struct Txn {
    pub(crate) id: u64,
}

impl Txn {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TxnState {
    Active,
    Committed,
    Aborted,
}

pub(crate) struct TxnRegistry {
    states: Mutex<HashMap<u64, TxnState>>,
    next_id: AtomicU64,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn begin(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.states.lock().insert(id, TxnState::Active);
        id
    }

    /// Ops of forgotten transactions are only reachable after their ops
    /// were applied, so the safe default is Committed.
    pub fn state(&self, id: u64) -> TxnState {
        self.states
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(TxnState::Committed)
    }

    pub fn set_state(&self, id: u64, state: TxnState) {
        self.states.lock().insert(id, state);
    }

    pub fn forget(&self, id: u64) {
        self.states.lock().remove(&id);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OpKind {
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
    Nop,
}

/// One pending operation. The record is behind a lock so an
/// overwrite-in-place through a coupled cursor does not reallocate the op.
pub(crate) struct TxnOp {
    pub txn_id: u64,
    pub kind: OpKind,
    pub dupe_position: DupePosition,
    /// 1-based duplicate reference, 0 when the op targets the whole key.
    pub referenced_dupe: u32,
    pub record: Mutex<Vec<u8>>,
    /// Order of the op across the whole index, for replay at commit.
    pub seq: u64,
}

impl TxnOp {
    pub fn record(&self) -> Vec<u8> {
        self.record.lock().clone()
    }

    pub fn is_erase(&self) -> bool {
        self.kind == OpKind::Erase
    }
}

#[derive(Default)]
pub(crate) struct OpNode {
    /// Oldest first.
    pub ops: Vec<Arc<TxnOp>>,
}

/// What the newest visible op says about a key.
pub(crate) enum Probe {
    /// The key exists with this op's record.
    Insert(Arc<TxnOp>),
    /// The key was erased by a pending or committed op.
    Erased(Arc<TxnOp>),
    /// The key is under a still-open foreign transaction.
    Conflict(Arc<TxnOp>),
    /// No visible op; fall through to the B-tree.
    None,
}

pub(crate) struct TxnIndex {
    registry: Arc<TxnRegistry>,
    nodes: Mutex<BTreeMap<Vec<u8>, OpNode>>,
    seq: AtomicU64,
}

impl TxnIndex {
    pub fn new(registry: Arc<TxnRegistry>) -> Self {
        Self {
            registry,
            nodes: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<TxnRegistry> {
        &self.registry
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Appends an op, first rejecting writes to keys held by another
    /// still-active transaction.
    pub fn append(
        &self,
        txn_id: u64,
        key: &[u8],
        kind: OpKind,
        dupe_position: DupePosition,
        referenced_dupe: u32,
        record: Vec<u8>,
    ) -> Result<Arc<TxnOp>> {
        match self.probe(key, Some(txn_id)) {
            Probe::Conflict(_) => return Err(Error::TxnConflict),
            _ => {}
        }
        let op = Arc::new(TxnOp {
            txn_id,
            kind,
            dupe_position,
            referenced_dupe,
            record: Mutex::new(record),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        self.nodes
            .lock()
            .entry(key.to_vec())
            .or_default()
            .ops
            .push(op.clone());
        Ok(op)
    }

    /// Resolves the newest op visible to `viewer` for `key`.
    pub fn probe(&self, key: &[u8], viewer: Option<u64>) -> Probe {
        let nodes = self.nodes.lock();
        let Some(node) = nodes.get(key) else {
            return Probe::None;
        };
        Self::probe_node(&self.registry, node, viewer)
    }

    fn probe_node(registry: &TxnRegistry, node: &OpNode, viewer: Option<u64>) -> Probe {
        for op in node.ops.iter().rev() {
            match registry.state(op.txn_id) {
                TxnState::Aborted => continue,
                TxnState::Active if viewer != Some(op.txn_id) => {
                    return Probe::Conflict(op.clone())
                }
                _ => {}
            }
            return match op.kind {
                OpKind::Erase => Probe::Erased(op.clone()),
                OpKind::Nop => continue,
                _ => Probe::Insert(op.clone()),
            };
        }
        Probe::None
    }

    /// The ops of one key, oldest first, skipping aborted transactions.
    /// This is the chain the duplicate cache folds.
    pub fn op_chain(&self, key: &[u8]) -> Vec<Arc<TxnOp>> {
        let nodes = self.nodes.lock();
        let Some(node) = nodes.get(key) else {
            return Vec::new();
        };
        node.ops
            .iter()
            .filter(|op| self.registry.state(op.txn_id) != TxnState::Aborted)
            .cloned()
            .collect()
    }

    /// First key at or after (`Geq`) / at or before (`Leq`) the bound with
    /// a probe other than `None`, together with that probe.
    pub fn scan(
        &self,
        bound: Bound<&[u8]>,
        forward: bool,
        viewer: Option<u64>,
    ) -> Option<(Vec<u8>, Probe)> {
        let nodes = self.nodes.lock();
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &OpNode)> + '_> = if forward {
            Box::new(nodes.range::<[u8], _>((bound, Bound::Unbounded)))
        } else {
            Box::new(nodes.range::<[u8], _>((Bound::Unbounded, bound)).rev())
        };
        for (key, node) in range {
            match Self::probe_node(&self.registry, node, viewer) {
                Probe::None => continue,
                probe => return Some((key.clone(), probe)),
            }
        }
        None
    }

    /// Detaches every op of `txn_id`, ordered for replay. Empty nodes are
    /// dropped on the way.
    pub fn take_txn_ops(&self, txn_id: u64) -> Vec<(Vec<u8>, Arc<TxnOp>)> {
        let mut nodes = self.nodes.lock();
        let mut taken = Vec::new();
        nodes.retain(|key, node| {
            node.ops.retain(|op| {
                if op.txn_id == txn_id {
                    taken.push((key.clone(), op.clone()));
                    false
                } else {
                    true
                }
            });
            !node.ops.is_empty()
        });
        taken.sort_by_key(|(_, op)| op.seq);
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> (TxnIndex, Arc<TxnRegistry>) {
        let registry = Arc::new(TxnRegistry::new());
        (TxnIndex::new(registry.clone()), registry)
    }

    #[test]
    fn newest_visible_op_wins() {
        let (index, registry) = index();
        let txn = registry.begin();
        index
            .append(txn, b"k", OpKind::Insert, DupePosition::Last, 0, b"a".to_vec())
            .unwrap();
        index
            .append(
                txn,
                b"k",
                OpKind::InsertOverwrite,
                DupePosition::Last,
                0,
                b"b".to_vec(),
            )
            .unwrap();
        match index.probe(b"k", Some(txn)) {
            Probe::Insert(op) => assert_eq!(op.record(), b"b"),
            _ => panic!("expected insert probe"),
        }
    }

    #[test]
    fn foreign_active_txn_conflicts() {
        let (index, registry) = index();
        let writer = registry.begin();
        index
            .append(writer, b"k", OpKind::Insert, DupePosition::Last, 0, vec![])
            .unwrap();
        let reader = registry.begin();
        assert!(matches!(index.probe(b"k", Some(reader)), Probe::Conflict(_)));
        assert!(index
            .append(reader, b"k", OpKind::Erase, DupePosition::Last, 0, vec![])
            .is_err());

        registry.set_state(writer, TxnState::Committed);
        assert!(matches!(index.probe(b"k", Some(reader)), Probe::Insert(_)));
    }

    #[test]
    fn aborted_ops_are_invisible() {
        let (index, registry) = index();
        let txn = registry.begin();
        index
            .append(txn, b"k", OpKind::Insert, DupePosition::Last, 0, vec![])
            .unwrap();
        registry.set_state(txn, TxnState::Aborted);
        assert!(matches!(index.probe(b"k", None), Probe::None));
    }

    #[test]
    fn erase_probe_reports_the_erase() {
        let (index, registry) = index();
        let txn = registry.begin();
        index
            .append(txn, b"k", OpKind::Insert, DupePosition::Last, 0, vec![])
            .unwrap();
        index
            .append(txn, b"k", OpKind::Erase, DupePosition::Last, 0, vec![])
            .unwrap();
        assert!(matches!(index.probe(b"k", Some(txn)), Probe::Erased(_)));
    }

    #[test]
    fn take_txn_ops_orders_by_sequence() {
        let (index, registry) = index();
        let txn = registry.begin();
        index
            .append(txn, b"b", OpKind::Insert, DupePosition::Last, 0, vec![])
            .unwrap();
        index
            .append(txn, b"a", OpKind::Insert, DupePosition::Last, 0, vec![])
            .unwrap();
        let ops = index.take_txn_ops(txn);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0, b"b");
        assert_eq!(ops[1].0, b"a");
        assert!(index.is_empty());
    }
}
