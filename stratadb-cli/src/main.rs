//! StrataDB command line: interactive shell and load generator

mod bench;
mod shell;

use anyhow::{bail, Context};
use std::path::PathBuf;
use stratadb_core::{Database, StorageConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage:
  stratadb <data-dir> [--config <file.json>] [--set <option>=<value> ...]
  stratadb bench <data-dir> [count]";

/// Parsed command line
enum Command {
    Shell { dir: PathBuf, config: StorageConfig },
    Bench { dir: PathBuf, count: usize },
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [cmd, dir, rest @ ..] if cmd == "bench" => {
            let count = match rest {
                [] => bench::DEFAULT_COUNT,
                [count] => count
                    .parse()
                    .with_context(|| format!("invalid record count {:?}", count))?,
                _ => bail!("unexpected arguments\n{}", USAGE),
            };
            Ok(Command::Bench {
                dir: PathBuf::from(dir),
                count,
            })
        }
        [dir, rest @ ..] if !dir.starts_with('-') => {
            let mut config = StorageConfig::default();
            let mut rest = rest.iter();
            while let Some(flag) = rest.next() {
                let arg = rest
                    .next()
                    .with_context(|| format!("{} needs a value\n{}", flag, USAGE))?;
                match flag.as_str() {
                    "--config" => {
                        let raw = std::fs::read_to_string(arg)
                            .with_context(|| format!("reading config file {}", arg))?;
                        config = serde_json::from_str(&raw)
                            .with_context(|| format!("parsing config file {}", arg))?;
                    }
                    "--set" => {
                        let (name, value) = arg
                            .split_once('=')
                            .with_context(|| format!("expected <option>=<value>, got {:?}", arg))?;
                        config.set(name.trim(), value)?;
                    }
                    other => bail!("unknown flag {:?}\n{}", other, USAGE),
                }
            }
            Ok(Command::Shell {
                dir: PathBuf::from(dir),
                config,
            })
        }
        _ => bail!("{}", USAGE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Shell { dir, config } => {
            info!("StrataDB {} opening {:?}", stratadb_core::VERSION, dir);
            let db = Database::open(&dir, config)
                .with_context(|| format!("opening database at {:?}", dir))?;
            let result = shell::run(&db).await;
            // close on every exit path, including shell errors
            db.close().context("closing database")?;
            result
        }
        Command::Bench { dir, count } => bench::run(&dir, count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_core::Compression;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_shell_args() {
        let cmd = parse_args(&args(&[
            "data",
            "--set",
            "compression=snappy",
            "--set",
            "cache_size=8MB",
        ]))
        .unwrap();
        match cmd {
            Command::Shell { dir, config } => {
                assert_eq!(dir, PathBuf::from("data"));
                assert_eq!(config.compression, Compression::Snappy);
                assert_eq!(config.cache_size, 8 << 20);
            }
            Command::Bench { .. } => panic!("expected shell"),
        }
    }

    #[test]
    fn test_parse_bench_args() {
        match parse_args(&args(&["bench", "/tmp/x", "500"])).unwrap() {
            Command::Bench { dir, count } => {
                assert_eq!(dir, PathBuf::from("/tmp/x"));
                assert_eq!(count, 500);
            }
            Command::Shell { .. } => panic!("expected bench"),
        }
    }

    #[test]
    fn test_reject_bad_args() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["data", "--set"])).is_err());
        assert!(parse_args(&args(&["data", "--set", "nope=1"])).is_err());
        assert!(parse_args(&args(&["data", "--verbose", "1"])).is_err());
        assert!(parse_args(&args(&["bench", "data", "many"])).is_err());
    }
}
