//! End-to-end engine flows: persistence across reopen, blob records,
//! extended keys, transactions and the in-memory mode.

use std::collections::BTreeMap;

use proptest::prelude::*;
use sable::{CursorMove, DbConfig, Env, EnvConfig, Error, InsertFlags};
use tempfile::TempDir;

#[test]
fn committed_data_survives_a_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    {
        let env = Env::open(&path, EnvConfig::default()).expect("create");
        let db = env.create_db(1, DbConfig::default()).expect("create db");
        for n in 0..200u32 {
            db.insert(None, &n.to_be_bytes(), format!("v{n}").as_bytes())
                .unwrap();
        }
        env.close().expect("close");
    }
    let env = Env::open(&path, EnvConfig::default()).expect("reopen");
    let db = env.open_db(1).expect("open db");
    for n in 0..200u32 {
        assert_eq!(
            db.find(None, &n.to_be_bytes()).unwrap(),
            format!("v{n}").into_bytes()
        );
    }
    assert!(matches!(
        db.find(None, &9999u32.to_be_bytes()),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn records_cover_every_representation() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    let cases: Vec<(&[u8], Vec<u8>)> = vec![
        (b"empty", Vec::new()),
        (b"tiny", b"abc".to_vec()),
        (b"small", b"12345678".to_vec()),
        (b"big", vec![0xA5; 300]),
        (b"huge", (0..40_000u32).map(|i| i as u8).collect()),
    ];
    {
        let env = Env::open(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for (key, record) in &cases {
            db.insert(None, key, record).unwrap();
        }
        // Exercise the representation transitions both ways.
        db.insert_with(None, b"tiny", &vec![7u8; 500], InsertFlags::OVERWRITE, 0)
            .unwrap();
        db.insert_with(None, b"big", b"xy", InsertFlags::OVERWRITE, 0)
            .unwrap();
        env.close().unwrap();
    }
    let env = Env::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"empty").unwrap(), Vec::<u8>::new());
    assert_eq!(db.find(None, b"tiny").unwrap(), vec![7u8; 500]);
    assert_eq!(db.find(None, b"small").unwrap(), b"12345678");
    assert_eq!(db.find(None, b"big").unwrap(), b"xy");
    assert_eq!(db.find(None, b"huge").unwrap(), cases[4].1);
}

#[test]
fn extended_keys_roundtrip() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    let long_a = vec![b'a'; 200];
    let mut long_b = long_a.clone();
    long_b.push(b'!');
    {
        let env = Env::open(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, &long_a, b"first").unwrap();
        db.insert(None, &long_b, b"second").unwrap();
        db.insert(None, b"short", b"third").unwrap();
        env.close().unwrap();
    }
    let env = Env::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, &long_a).unwrap(), b"first");
    assert_eq!(db.find(None, &long_b).unwrap(), b"second");

    let mut cursor = db.cursor(None);
    let (key, _) = cursor.move_to(CursorMove::First, false).unwrap();
    assert_eq!(key, long_a);
    let (key, _) = cursor.move_to(CursorMove::Next, false).unwrap();
    assert_eq!(key, long_b);

    db.erase(None, &long_a).unwrap();
    assert!(db.find(None, &long_a).is_err());
    assert_eq!(db.find(None, &long_b).unwrap(), b"second");
}

#[test]
fn in_memory_env_has_no_file_and_no_reclaim() {
    let env = Env::memory(EnvConfig::default()).expect("memory env");
    let db = env.create_db(1, DbConfig::default()).unwrap();
    for n in 0..500u32 {
        db.insert(None, &n.to_be_bytes(), b"mem").unwrap();
    }
    for n in 0..500u32 {
        assert_eq!(db.find(None, &n.to_be_bytes()).unwrap(), b"mem");
    }
    let pm = env.page_manager();
    // Freed pages are dropped, not freelisted, in memory.
    db.erase(None, &1u32.to_be_bytes()).unwrap();
    pm.reclaim_space().expect("reclaim is a no-op");
    env.close().expect("close");
}

#[test]
fn txn_commit_applies_and_abort_discards() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    let env = Env::open(&path, EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"stable", b"disk").unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"pending", b"yes").unwrap();
    db.erase(Some(&txn), b"stable").unwrap();
    // Uncommitted state is invisible outside the transaction.
    assert_eq!(db.find(None, b"stable").unwrap(), b"disk");
    env.txn_commit(txn).unwrap();
    assert_eq!(db.find(None, b"pending").unwrap(), b"yes");
    assert!(db.find(None, b"stable").is_err());

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"ghost", b"boo").unwrap();
    env.txn_abort(txn).unwrap();
    assert!(db.find(None, b"ghost").is_err());
}

#[test]
fn recovery_mode_checkpoints_eagerly() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    {
        let env = Env::open(&path, EnvConfig::durable()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        let txn = env.txn_begin().unwrap();
        for n in 0..50u32 {
            db.insert(Some(&txn), &n.to_be_bytes(), b"durable").unwrap();
        }
        env.txn_commit(txn).unwrap();
        env.close().unwrap();
    }
    let env = Env::open(&path, EnvConfig::durable()).unwrap();
    let db = env.open_db(1).unwrap();
    for n in 0..50u32 {
        assert_eq!(db.find(None, &n.to_be_bytes()).unwrap(), b"durable");
    }
}

#[test]
fn read_only_env_rejects_writes() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("engine.sable");
    {
        let env = Env::open(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v").unwrap();
        env.close().unwrap();
    }
    let config = EnvConfig {
        read_only: true,
        ..EnvConfig::default()
    };
    let env = Env::open(&path, config).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    assert!(db.insert(None, b"new", b"x").is_err());
    assert!(env.txn_begin().is_err());
}

#[test]
fn duplicate_databases_are_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let env = Env::open(dir.path().join("engine.sable"), EnvConfig::default()).unwrap();
    env.create_db(1, DbConfig::default()).unwrap();
    assert!(env.create_db(1, DbConfig::default()).is_err());
    assert!(env.create_db(0, DbConfig::default()).is_err());
    env.create_db(2, DbConfig::with_duplicates()).unwrap();
    let db = env.open_db(2).unwrap();
    assert!(db.config().enable_duplicates);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // The cursor walk over random insert/overwrite/erase traffic matches
    // an in-memory model.
    #[test]
    fn prop_walk_matches_model(
        ops in prop::collection::vec((0u16..64, any::<u16>(), prop::bool::ANY), 1..150)
    ) {
        let dir = TempDir::new().expect("temp dir");
        let env = Env::open(dir.path().join("model.sable"), EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for (key, value, erase) in ops {
            let key = key.to_be_bytes().to_vec();
            if erase {
                let expected = model.remove(&key).is_some();
                let got = db.erase(None, &key).is_ok();
                prop_assert_eq!(expected, got);
            } else {
                let record = value.to_be_bytes().to_vec();
                db.insert_with(None, &key, &record, InsertFlags::OVERWRITE, 0).unwrap();
                model.insert(key, record);
            }
        }

        let mut walked = Vec::new();
        let mut cursor = db.cursor(None);
        let mut step = cursor.move_to(CursorMove::First, true);
        while let Ok((key, record)) = step {
            walked.push((key, record));
            step = cursor.move_to(CursorMove::Next, true);
        }
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(walked, expected);
    }
}
