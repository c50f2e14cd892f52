//! End-to-end tests through the public `Database` API

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use stratadb_core::query::QueryParams;
use stratadb_core::{Compression, Database, Key, QueryStatus, StorageConfig};
use tempfile::TempDir;

const CATEGORIES: [&str; 4] = ["electronics", "books", "home", "toys"];

fn product(i: Key) -> String {
    format!(
        "{}|{}.50|Product {}",
        CATEGORIES[(i % 4) as usize],
        10 + i % 90,
        i
    )
}

fn small_config() -> StorageConfig {
    StorageConfig {
        memtable_size_limit: 8 * 1024,
        block_size: 1024,
        l0_compaction_trigger: 3,
        base_level_size: 64 * 1024,
        target_file_size: 16 * 1024,
        ..Default::default()
    }
}

/// Copy a live data directory, as a crash would leave it on disk
fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

#[test]
fn test_round_trip_and_overwrite() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), small_config()).unwrap();

    for i in -50..50 {
        db.put(i, product(i)).unwrap();
    }
    for i in -50..50 {
        assert_eq!(db.get(i).unwrap(), Some(Bytes::from(product(i))));
    }

    db.put(7, "first").unwrap();
    db.put(7, "second").unwrap();
    assert_eq!(db.get(7).unwrap(), Some(Bytes::from("second")));

    // empty values are values, not deletions
    db.put(8, "").unwrap();
    assert_eq!(db.get(8).unwrap(), Some(Bytes::new()));
}

#[test]
fn test_deletion_hides_key_from_get_and_range() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), small_config()).unwrap();

    for i in 0..20 {
        db.put(i, product(i)).unwrap();
    }
    db.flush().unwrap();
    db.remove(5).unwrap();

    assert_eq!(db.get(5).unwrap(), None);
    let keys: Vec<Key> = db.range(0, 10, true).unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![0, 1, 2, 3, 4, 6, 7, 8, 9, 10]);

    // re-insert after delete
    db.put(5, "back").unwrap();
    assert_eq!(db.get(5).unwrap(), Some(Bytes::from("back")));
}

#[test]
fn test_range_matches_model() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), small_config()).unwrap();
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    for round in 0..3000 {
        let key: Key = rng.gen_range(0..500);
        if rng.gen_bool(0.2) {
            db.remove(key).unwrap();
            model.remove(&key);
        } else {
            let value = format!("{}|{}", product(key), round);
            db.put(key, value.clone()).unwrap();
            model.insert(key, Bytes::from(value));
        }
    }

    for (a, b) in [(0, 499), (100, 110), (250, 250), (490, 600), (-10, 3)] {
        let expected: Vec<(Key, Bytes)> = model
            .range(a..=b)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        assert_eq!(db.range(a, b, true).unwrap(), expected, "range {}..={}", a, b);

        let exclusive: Vec<(Key, Bytes)> = model
            .range(a..b)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        assert_eq!(db.range(a, b, false).unwrap(), exclusive, "range {}..{}", a, b);
    }
    assert!(db.range(10, 5, true).unwrap().is_empty());

    db.compact().unwrap();
    let all: Vec<(Key, Bytes)> = model.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(db.scan(..).unwrap().collect::<Result<Vec<_>, _>>().unwrap(), all);
}

#[test]
fn test_crash_recovery_replays_wal() {
    let dir = TempDir::new().unwrap();
    let crashed = TempDir::new().unwrap();

    let db = Database::open(dir.path(), StorageConfig::default()).unwrap();
    for i in 0..500 {
        db.put(i, product(i)).unwrap();
    }
    for i in (0..500).step_by(10) {
        db.remove(i).unwrap();
    }
    db.sync().unwrap();
    let before: Vec<(Key, Bytes)> = db.range(Key::MIN, Key::MAX, true).unwrap();

    // image of the directory with nothing flushed
    copy_dir(dir.path(), crashed.path());
    drop(db);

    let recovered = Database::open(crashed.path(), StorageConfig::default()).unwrap();
    assert_eq!(recovered.range(Key::MIN, Key::MAX, true).unwrap(), before);
    assert_eq!(recovered.stats().last_sequence, 550);
}

#[test]
fn test_compaction_keeps_newest_versions() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), small_config()).unwrap();

    for version in 0..5 {
        for i in 0..300 {
            db.put(i, format!("v{} {}", version, product(i))).unwrap();
        }
        db.flush().unwrap();
    }
    for i in 0..100 {
        db.remove(i).unwrap();
    }
    db.compact().unwrap();

    let stats = db.stats();
    assert_eq!(stats.total_entries, 200);
    assert_eq!(db.get(50).unwrap(), None);
    assert_eq!(
        db.get(150).unwrap(),
        Some(Bytes::from(format!("v4 {}", product(150))))
    );
    assert_eq!(db.range(0, 99, true).unwrap().len(), 0);
    assert_eq!(db.range(0, 299, true).unwrap().len(), 200);
}

#[test]
fn test_scan_never_sees_later_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path(), small_config()).unwrap());
    for i in 0..1000 {
        db.put(i, "0").unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut round = 1u64;
            while !done.load(Ordering::Acquire) {
                for i in (0..1000).step_by(7) {
                    db.put(i, round.to_string()).unwrap();
                }
                db.put(1000 + round as Key, "new").unwrap();
                round += 1;
            }
        })
    };

    for _ in 0..20 {
        let snapshot = db.snapshot().unwrap();
        let seen: Vec<(Key, Bytes)> = snapshot.scan(..).unwrap().map(|r| r.unwrap()).collect();
        // a second pass at the same snapshot sees the same rows
        let again: Vec<(Key, Bytes)> = snapshot.scan(..).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(seen, again);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        for (key, value) in &seen[..1000] {
            assert_eq!(snapshot.get(*key).unwrap().as_ref(), Some(value));
        }

        // a plain scan sees a prefix of the write order: rounds never
        // increase along the keys a round rewrites
        let rounds: Vec<u64> = db
            .scan(0..1000)
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|(k, _)| k % 7 == 0)
            .map(|(_, v)| std::str::from_utf8(&v).unwrap().parse().unwrap())
            .collect();
        assert_eq!(rounds.len(), 143);
        assert!(rounds.windows(2).all(|w| w[0] >= w[1]), "{:?}", rounds);
    }

    done.store(true, Ordering::Release);
    writer.join().unwrap();
}

#[test]
fn test_product_scenario_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(dir.path(), small_config()).unwrap();
        for i in 1..=1000 {
            db.put(i, product(i)).unwrap();
        }

        let entries = db.range(100, 110, true).unwrap();
        assert_eq!(entries.len(), 11);
        let keys: Vec<Key> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (100..=110).collect::<Vec<_>>());
        assert_eq!(entries[0].1, Bytes::from(product(100)));

        db.remove(2).unwrap();
        assert_eq!(db.get(2).unwrap(), None);
        assert_eq!(db.get(1).unwrap(), Some(Bytes::from(product(1))));
        db.sync().unwrap();
    }

    let db = Database::open(dir.path(), small_config()).unwrap();
    assert_eq!(db.get(2).unwrap(), None);
    let all = db.range(1, 1000, true).unwrap();
    assert_eq!(all.len(), 999);
    for (key, value) in all {
        assert_eq!(value, Bytes::from(product(key)));
    }
}

#[test]
fn test_tables_keep_their_compression() {
    let dir = TempDir::new().unwrap();
    {
        let config = StorageConfig {
            compression: Compression::Lz4,
            ..small_config()
        };
        let db = Database::open(dir.path(), config).unwrap();
        for i in 0..200 {
            db.put(i, product(i)).unwrap();
        }
        db.close().unwrap();
    }

    let config = StorageConfig {
        compression: Compression::Snappy,
        ..small_config()
    };
    let db = Database::open(dir.path(), config).unwrap();
    for i in 200..400 {
        db.put(i, product(i)).unwrap();
    }
    db.flush().unwrap();
    assert_eq!(db.range(0, 399, true).unwrap().len(), 400);
    db.compact().unwrap();
    assert_eq!(db.get(10).unwrap(), Some(Bytes::from(product(10))));
    assert_eq!(db.get(310).unwrap(), Some(Bytes::from(product(310))));
}

#[test]
fn test_queries_over_products() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), small_config()).unwrap();
    for i in 1..=200 {
        db.put(i, product(i)).unwrap();
    }

    let mut params = QueryParams::new();
    let response = db.execute_query("category = 'books' AND key <= 20", &params);
    assert_eq!(response.status, QueryStatus::Ok);
    let keys: Vec<Key> = response.results.iter().filter_map(|r| r.key).collect();
    assert_eq!(keys, vec![1, 5, 9, 13, 17]);
    assert_eq!(response.scanned, 20);

    params.insert("max".into(), "15".into());
    let result = db
        .query("SELECT key FROM products WHERE price < $max LIMIT 3", &params)
        .unwrap();
    let keys: Vec<Key> = result.rows.iter().filter_map(|r| r.key).collect();
    assert_eq!(keys, vec![1, 2, 3]);
    assert!(result.rows.iter().all(|r| r.value.is_none()));

    let mut range = QueryParams::new();
    range.insert("start".into(), "150".into());
    range.insert("end".into(), "159".into());
    let response = db.execute_query("name LIKE 'Product 15%'", &range);
    assert_eq!(response.results.len(), 10);
    assert_eq!(response.scanned, 10);

    let response = db.execute_query("SELECT category, count(*) FROM t GROUP BY category", &params);
    assert_eq!(response.status, QueryStatus::Unsupported);
    assert!(response.results.is_empty());
}

#[test]
fn test_config_dictionary_opens_database() {
    let dir = TempDir::new().unwrap();
    let options = [
        ("cache_size", "1MB"),
        ("max_open_files", "8"),
        ("compression", "snappy"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = StorageConfig::from_options(&options).unwrap();
    let db = Database::open(dir.path(), config).unwrap();
    db.put(1, "x").unwrap();
    assert_eq!(db.config().max_open_files, 8);

    let mut bad = options_with("cache_size", "1MB");
    bad.insert("cache_sizes".into(), "2MB".into());
    assert!(StorageConfig::from_options(&bad).is_err());
}

fn options_with(name: &str, value: &str) -> std::collections::HashMap<String, String> {
    let mut options = std::collections::HashMap::new();
    options.insert(name.to_string(), value.to_string());
    options
}
