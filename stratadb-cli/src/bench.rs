//! Load generator: bulk insert then timed reads, scans and a query

use anyhow::Context;
use rand::Rng;
use std::path::Path;
use std::time::{Duration, Instant};
use stratadb_core::query::QueryParams;
use stratadb_core::{Database, Key, StorageConfig};
use tracing::info;

pub const DEFAULT_COUNT: usize = 100_000;

const CATEGORIES: [&str; 4] = ["electronics", "books", "home", "toys"];
const POINT_READS: usize = 10_000;
const RANGE_SCANS: usize = 1_000;
const RANGE_WIDTH: Key = 100;

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{:<14} {:>9} ops in {:>8.3}s  ({:>10.0} ops/s)",
        label,
        ops,
        secs,
        ops as f64 / secs
    );
}

pub fn run(dir: &Path, count: usize) -> anyhow::Result<()> {
    let db = Database::open(dir, StorageConfig::default())
        .with_context(|| format!("opening database at {:?}", dir))?;
    let result = load(&db, count);
    db.close().context("closing database")?;
    result
}

fn load(db: &Database, count: usize) -> anyhow::Result<()> {
    let mut rng = rand::thread_rng();
    let count = count.max(1);
    let max_key = count as Key;
    info!("Inserting {} records", count);

    let start = Instant::now();
    for i in 0..max_key {
        let category = CATEGORIES[rng.gen_range(0..CATEGORIES.len())];
        let price: f64 = rng.gen_range(1.0..500.0);
        db.put(i, format!("{}|{:.2}|Product {}", category, price, i))?;
    }
    db.sync()?;
    report("put", count, start.elapsed());

    let start = Instant::now();
    let mut found = 0usize;
    for _ in 0..POINT_READS {
        if db.get(rng.gen_range(0..max_key))?.is_some() {
            found += 1;
        }
    }
    report("get", POINT_READS, start.elapsed());
    anyhow::ensure!(found == POINT_READS, "{} of {} reads missed", POINT_READS - found, POINT_READS);

    let start = Instant::now();
    let mut scanned = 0usize;
    for _ in 0..RANGE_SCANS {
        let from = rng.gen_range(0..max_key);
        scanned += db.range(from, from + RANGE_WIDTH - 1, true)?.len();
    }
    report("range(100)", RANGE_SCANS, start.elapsed());
    info!("Range scans returned {} entries", scanned);

    let mut params = QueryParams::new();
    params.insert("max".into(), "50".into());
    let start = Instant::now();
    let result = db.query("SELECT key FROM products WHERE category = 'books' AND price < $max", &params)?;
    report("query", 1, start.elapsed());
    println!(
        "query matched {} of {} records ({:.2}ms in executor)",
        result.rows.len(),
        result.scanned,
        result.execution_time_ms
    );

    println!("{}", serde_json::to_string_pretty(&db.stats())?);
    Ok(())
}
