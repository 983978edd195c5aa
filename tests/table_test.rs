//! End-to-end table tests: insert/find/delete through the full stack,
//! tree integrity under churn, durability across shutdown.

mod test_utils;

use acorn_db::{Database, DbOptions, Error};
use log::debug;
use rand::prelude::*;

use test_utils::{patterned_value, random_value, setup, TestDir};

#[test]
fn test_sequential_insert_find() {
    setup();
    let dir = TestDir::new("table");
    let db = Database::open().unwrap();
    let table = db.open_table(dir.path("seq.db")).unwrap();

    for key in 0..1000 {
        db.insert(table, key, &patterned_value(key)).unwrap();
    }

    for key in 0..1000 {
        let value = db.find(table, key).unwrap();
        assert_eq!(value, patterned_value(key), "key {}", key);
    }

    match db.find(table, 1000) {
        Err(Error::NotFound(1000)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }

    db.check_tree(table).unwrap();
}

#[test]
fn test_random_insert_delete() {
    setup();
    let dir = TestDir::new("table");
    let db = Database::open().unwrap();
    let table = db.open_table(dir.path("random.db")).unwrap();

    let n = 2000;
    let mut rng = StdRng::seed_from_u64(0xACDB);

    let mut keys: Vec<i64> = (0..n).collect();
    keys.shuffle(&mut rng);

    let mut values = std::collections::HashMap::new();
    for &key in &keys {
        let value = random_value(&mut rng);
        db.insert(table, key, &value).unwrap();
        values.insert(key, value);
    }

    for key in 0..n {
        assert_eq!(db.find(table, key).unwrap(), values[&key], "key {}", key);
    }
    db.check_tree(table).unwrap();

    keys.shuffle(&mut rng);
    for (i, &key) in keys.iter().enumerate() {
        db.delete(table, key).unwrap();

        assert!(db.find(table, key).is_err(), "key {} survived its delete", key);

        // one of the still-present keys must remain reachable
        if let Some(&survivor) = keys.get(i + 1) {
            assert_eq!(
                db.find(table, survivor).unwrap(),
                values[&survivor],
                "survivor {} lost after deleting {}",
                survivor,
                key
            );
        }

        if i % 500 == 0 {
            db.check_tree(table).unwrap();
        }
    }

    db.check_tree(table).unwrap();
    debug!("final tree:\n{}", db.format_tree(table).unwrap());
}

#[test]
fn test_deep_tree_grows_and_shrinks() {
    setup();
    let dir = TestDir::new("table");
    // a small pool forces eviction traffic while the tree is built
    let db = Database::open_with(DbOptions { num_buffers: 32 }).unwrap();
    let table = db.open_table(dir.path("deep.db")).unwrap();

    let n = 5000;
    let value = [0x5A; 112];
    for key in 0..n {
        db.insert(table, key, &value).unwrap();
    }
    db.check_tree(table).unwrap();

    for key in 0..n {
        assert_eq!(db.find(table, key).unwrap(), &value[..], "key {}", key);
    }

    // tear everything down again, back to an empty tree
    for key in (0..n).rev() {
        db.delete(table, key).unwrap();
        if key % 1000 == 0 {
            db.check_tree(table).unwrap();
        }
    }

    assert!(db.find(table, 0).is_err());
    db.check_tree(table).unwrap();
}

#[test]
fn test_duplicate_insert_is_a_silent_success() {
    setup();
    let dir = TestDir::new("table");
    let db = Database::open().unwrap();
    let table = db.open_table(dir.path("dup.db")).unwrap();

    db.insert(table, 42, b"original").unwrap();
    db.insert(table, 42, b"pretender").unwrap();

    assert_eq!(db.find(table, 42).unwrap(), b"original");
}

#[test]
fn test_value_size_bounds() {
    setup();
    let dir = TestDir::new("table");
    let db = Database::open().unwrap();
    let table = db.open_table(dir.path("size.db")).unwrap();

    match db.insert(table, 1, b"") {
        Err(Error::InvalidValueSize(0)) => {}
        other => panic!("expected InvalidValueSize, got {:?}", other),
    }
    match db.insert(table, 1, &[0u8; 113]) {
        Err(Error::InvalidValueSize(113)) => {}
        other => panic!("expected InvalidValueSize, got {:?}", other),
    }

    // both bounds are inclusive
    db.insert(table, 1, &[1u8; 1]).unwrap();
    db.insert(table, 2, &[2u8; 112]).unwrap();
    assert_eq!(db.find(table, 2).unwrap().len(), 112);
}

#[test]
fn test_delete_missing_key() {
    setup();
    let dir = TestDir::new("table");
    let db = Database::open().unwrap();
    let table = db.open_table(dir.path("missing.db")).unwrap();

    assert!(db.delete(table, 1).is_err());

    db.insert(table, 1, b"here").unwrap();
    db.delete(table, 1).unwrap();
    assert!(db.delete(table, 1).is_err());
}

#[test]
fn test_committed_data_survives_shutdown() {
    setup();
    let dir = TestDir::new("table");
    let path = dir.path("durable.db");

    {
        let db = Database::open().unwrap();
        let table = db.open_table(&path).unwrap();
        for key in 0..200 {
            db.insert(table, key, &patterned_value(key)).unwrap();
        }

        let trx = db.begin();
        db.update(table, 7, b"updated under the transaction", trx).unwrap();
        db.commit(trx).unwrap();

        db.shutdown().unwrap();
    }

    let db = Database::open().unwrap();
    let table = db.open_table(&path).unwrap();

    assert_eq!(db.find(table, 7).unwrap(), b"updated under the transaction");
    for key in 0..200 {
        if key == 7 {
            continue;
        }
        assert_eq!(db.find(table, key).unwrap(), patterned_value(key));
    }
    db.check_tree(table).unwrap();
}
