//! Cursor behavior across the B-tree and the transaction overlay: the
//! coupling lifecycle, the merge walk and the duplicate cache.

use sable::{CursorMove, Db, DbConfig, Env, EnvConfig, Error, InsertFlags};
use tempfile::TempDir;

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn open_db(dir: &TempDir, config: EnvConfig, db_config: DbConfig) -> (Env, Db) {
    let env = Env::open(dir.path().join("cursor.sable"), config).expect("open env");
    let db = env.create_db(1, db_config).expect("create db");
    (env, db)
}

#[test]
fn uncoupled_cursor_survives_eviction() {
    // S4: uncouple at key 500, evict the page, then NEXT yields 501.
    let dir = TempDir::new().expect("temp dir");
    let config = EnvConfig {
        cache_capacity: 4096,
        ..EnvConfig::default()
    };
    let (env, db) = open_db(&dir, config, DbConfig::default());
    for n in 1..=1000u32 {
        db.insert(None, &key(n), format!("record-{n}").as_bytes())
            .expect("insert");
    }

    let mut cursor = db.cursor(None);
    cursor.find(&key(500)).expect("find key 500");
    cursor.uncouple().expect("uncouple");
    env.page_manager().purge_cache().expect("purge");

    let (found, record) = cursor.move_to(CursorMove::Next, false).expect("next");
    assert_eq!(found, key(501));
    assert_eq!(record, b"record-501");
}

#[test]
fn hybrid_walk_sees_the_txn_overwrite() {
    // S5: keys {1,2,3} with records {A,B,C}; an uncommitted overwrite of
    // key 2 shows up mid-walk.
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    db.insert(None, &key(1), b"A").unwrap();
    db.insert(None, &key(2), b"B").unwrap();
    db.insert(None, &key(3), b"C").unwrap();

    let txn = env.txn_begin().expect("begin txn");
    db.insert_with(Some(&txn), &key(2), b"B'", InsertFlags::OVERWRITE, 0)
        .expect("overwrite in txn");

    let mut cursor = db.cursor(Some(&txn));
    let (k, r) = cursor.move_to(CursorMove::First, false).unwrap();
    assert_eq!((k.as_slice(), r.as_slice()), (&key(1)[..], b"A".as_ref()));
    let (k, r) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!((k.as_slice(), r.as_slice()), (&key(2)[..], b"B'".as_ref()));
    let (k, r) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!((k.as_slice(), r.as_slice()), (&key(3)[..], b"C".as_ref()));
    assert!(matches!(
        cursor.move_to(CursorMove::Next, false),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn dupecache_folds_txn_ops_in_order() {
    // S6: duplicates [d0,d1,d2]; a txn inserts x before position 2 and
    // erases position 1; iteration yields [x,d1,d2].
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::with_duplicates());
    let k = key(7);
    db.insert(None, &k, b"d0").unwrap();
    db.insert_with(None, &k, b"d1", InsertFlags::DUPLICATE, 0).unwrap();
    db.insert_with(None, &k, b"d2", InsertFlags::DUPLICATE, 0).unwrap();

    let txn = env.txn_begin().expect("begin txn");
    db.insert_with(
        Some(&txn),
        &k,
        b"x",
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_BEFORE,
        2,
    )
    .expect("insert duplicate before #2");

    {
        // Erase the first duplicate through a positioned cursor.
        let mut cursor = db.cursor(Some(&txn));
        let (_, record) = cursor.move_to(CursorMove::First, false).unwrap();
        assert_eq!(record, b"d0");
        cursor.erase().expect("erase first duplicate");
    }

    let mut cursor = db.cursor(Some(&txn));
    let mut records = Vec::new();
    let mut step = cursor.move_to(CursorMove::First, false);
    while let Ok((_, record)) = step {
        records.push(record);
        step = cursor.move_to(CursorMove::Next, false);
    }
    assert_eq!(records, vec![b"x".to_vec(), b"d1".to_vec(), b"d2".to_vec()]);

    let mut cursor = db.cursor(Some(&txn));
    cursor.move_to(CursorMove::First, false).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 3);
}

#[test]
fn duplicates_iterate_in_insertion_order() {
    let dir = TempDir::new().expect("temp dir");
    let (_env, db) = open_db(&dir, EnvConfig::default(), DbConfig::with_duplicates());
    let k = key(1);
    db.insert(None, &k, b"one").unwrap();
    db.insert_with(None, &k, b"two", InsertFlags::DUPLICATE, 0).unwrap();
    db.insert_with(None, &k, b"zero", InsertFlags::DUPLICATE_FIRST, 0)
        .unwrap();

    let mut cursor = db.cursor(None);
    let (_, first) = cursor.move_to(CursorMove::First, false).unwrap();
    assert_eq!(first, b"zero");
    let (_, second) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(second, b"one");
    let (_, third) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(third, b"two");
    assert!(cursor.move_to(CursorMove::Next, false).is_err());
}

#[test]
fn skip_duplicates_visits_each_key_once() {
    let dir = TempDir::new().expect("temp dir");
    let (_env, db) = open_db(&dir, EnvConfig::default(), DbConfig::with_duplicates());
    for n in [1u32, 2] {
        db.insert(None, &key(n), b"a").unwrap();
        db.insert_with(None, &key(n), b"b", InsertFlags::DUPLICATE, 0)
            .unwrap();
    }
    let mut cursor = db.cursor(None);
    let mut keys = Vec::new();
    let mut step = cursor.move_to(CursorMove::First, true);
    while let Ok((k, _)) = step {
        keys.push(k);
        step = cursor.move_to(CursorMove::Next, true);
    }
    assert_eq!(keys, vec![key(1).to_vec(), key(2).to_vec()]);
}

#[test]
fn uncouple_recouple_returns_to_the_same_key() {
    let dir = TempDir::new().expect("temp dir");
    let (_env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    for n in 1..=100u32 {
        db.insert(None, &key(n), &key(n)).unwrap();
    }
    let mut cursor = db.cursor(None);
    cursor.find(&key(50)).unwrap();
    cursor.uncouple().unwrap();
    let (next, _) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(next, key(51));
    let (back, _) = cursor.move_to(CursorMove::Previous, false).unwrap();
    assert_eq!(back, key(50));
}

#[test]
fn erase_then_next_lands_on_the_successor() {
    let dir = TempDir::new().expect("temp dir");
    let (_env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    for n in [10u32, 20, 30] {
        db.insert(None, &key(n), &key(n)).unwrap();
    }
    let mut cursor = db.cursor(None);
    cursor.find(&key(20)).unwrap();
    cursor.erase().expect("erase key 20");
    assert!(db.find(None, &key(20)).is_err());

    let (next, _) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(next, key(30));
}

#[test]
fn erase_of_the_last_key_exhausts_the_cursor() {
    let dir = TempDir::new().expect("temp dir");
    let (_env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    for n in [10u32, 20] {
        db.insert(None, &key(n), &key(n)).unwrap();
    }
    let mut cursor = db.cursor(None);
    cursor.find(&key(20)).unwrap();
    cursor.erase().unwrap();
    assert!(matches!(
        cursor.move_to(CursorMove::Next, false),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn txn_erase_hides_the_key_from_the_walk() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    for n in [1u32, 2, 3] {
        db.insert(None, &key(n), &key(n)).unwrap();
    }
    let txn = env.txn_begin().unwrap();
    db.erase(Some(&txn), &key(2)).expect("erase in txn");

    let mut cursor = db.cursor(Some(&txn));
    let (first, _) = cursor.move_to(CursorMove::First, false).unwrap();
    assert_eq!(first, key(1));
    let (second, _) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(second, key(3));

    // An aborted erase becomes visible again.
    env.txn_abort(txn).unwrap();
    let mut cursor = db.cursor(None);
    cursor.move_to(CursorMove::First, false).unwrap();
    let (second, _) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(second, key(2));
}

#[test]
fn txn_only_keys_merge_into_the_walk() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    db.insert(None, &key(2), b"disk").unwrap();
    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), &key(1), b"pending").unwrap();
    db.insert(Some(&txn), &key(3), b"pending").unwrap();

    let mut cursor = db.cursor(Some(&txn));
    let mut keys = Vec::new();
    let mut step = cursor.move_to(CursorMove::First, false);
    while let Ok((k, _)) = step {
        keys.push(k);
        step = cursor.move_to(CursorMove::Next, false);
    }
    assert_eq!(keys, vec![key(1).to_vec(), key(2).to_vec(), key(3).to_vec()]);
}

#[test]
fn backward_walk_mirrors_the_forward_walk() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    db.insert(None, &key(1), b"a").unwrap();
    db.insert(None, &key(3), b"c").unwrap();
    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), &key(2), b"b").unwrap();

    let mut cursor = db.cursor(Some(&txn));
    let (k, _) = cursor.move_to(CursorMove::Last, false).unwrap();
    assert_eq!(k, key(3));
    let (k, _) = cursor.move_to(CursorMove::Previous, false).unwrap();
    assert_eq!(k, key(2));
    let (k, _) = cursor.move_to(CursorMove::Previous, false).unwrap();
    assert_eq!(k, key(1));
    assert!(cursor.move_to(CursorMove::Previous, false).is_err());
}

#[test]
fn direction_change_resyncs_the_sides() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    for n in 1..=5u32 {
        db.insert(None, &key(n), &key(n)).unwrap();
    }
    let txn = env.txn_begin().unwrap();
    db.insert_with(Some(&txn), &key(3), b"three", InsertFlags::OVERWRITE, 0)
        .unwrap();

    let mut cursor = db.cursor(Some(&txn));
    cursor.move_to(CursorMove::First, false).unwrap();
    cursor.move_to(CursorMove::Next, false).unwrap();
    let (k, r) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!((k.as_slice(), r.as_slice()), (&key(3)[..], b"three".as_ref()));
    let (k, _) = cursor.move_to(CursorMove::Previous, false).unwrap();
    assert_eq!(k, key(2));
    let (k, r) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!((k.as_slice(), r.as_slice()), (&key(3)[..], b"three".as_ref()));
}

#[test]
fn cursor_overwrite_goes_through_the_txn() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    db.insert(None, &key(1), b"old").unwrap();

    let txn = env.txn_begin().unwrap();
    let mut cursor = db.cursor(Some(&txn));
    cursor.move_to(CursorMove::First, false).unwrap();
    cursor.overwrite(b"new").expect("overwrite");

    // Pending view sees the new record, a plain view still the old one.
    assert_eq!(db.find(Some(&txn), &key(1)).unwrap(), b"new");
    env.txn_commit(txn).unwrap();
    assert_eq!(db.find(None, &key(1)).unwrap(), b"new");
}

#[test]
fn conflicting_txn_keys_surface_as_conflicts() {
    let dir = TempDir::new().expect("temp dir");
    let (env, db) = open_db(&dir, EnvConfig::default(), DbConfig::default());
    let writer = env.txn_begin().unwrap();
    db.insert(Some(&writer), &key(1), b"w").unwrap();

    let reader = env.txn_begin().unwrap();
    assert!(matches!(
        db.find(Some(&reader), &key(1)),
        Err(Error::TxnConflict)
    ));
    let mut cursor = db.cursor(Some(&reader));
    assert!(matches!(
        cursor.move_to(CursorMove::First, false),
        Err(Error::TxnConflict)
    ));

    env.txn_commit(writer).unwrap();
    assert_eq!(db.find(Some(&reader), &key(1)).unwrap(), b"w");
    env.txn_commit(reader).unwrap();
}
