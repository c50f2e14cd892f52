//! Line-oriented shell over an open database

use anyhow::{bail, Context};
use stratadb_core::query::QueryParams;
use stratadb_core::{Database, Key};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  put <key> <value...>        insert or overwrite a key
  get <key>                   print a value
  del <key>                   delete a key
  range <start> <end> [excl]  list live entries in key order
  query <predicate...>        run a predicate query, e.g. price < $max
  param <name> <value>        bind a query parameter (start, end, format, ...)
  unparam <name>              remove a query parameter
  sync                        make every write durable
  flush                       flush the memtable to a table
  compact                     merge every table into the bottom level
  stats                       print engine statistics
  help                        this text
  quit                        close the database and exit";

/// What the loop does after a line
enum Outcome {
    Continue,
    Quit,
}

/// Read commands from stdin until `quit`, end of input or Ctrl-C
pub async fn run(db: &Database) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut params = QueryParams::new();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"strata> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        match execute(db, &mut params, &line) {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::Quit) => break,
            Err(e) => {
                warn!("{:#}", e);
                println!("ERR {:#}", e);
            }
        }
    }
    Ok(())
}

fn parse_key(raw: Option<&str>) -> anyhow::Result<Key> {
    let raw = raw.context("missing key")?;
    raw.parse()
        .with_context(|| format!("key must be an integer, got {:?}", raw))
}

/// Run one command line
fn execute(db: &Database, params: &mut QueryParams, line: &str) -> anyhow::Result<Outcome> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut words = rest.split_whitespace();

    match cmd.to_ascii_lowercase().as_str() {
        "" => {}
        "put" | "set" => {
            let key = parse_key(words.next())?;
            let value = rest
                .split_once(char::is_whitespace)
                .map(|(_, v)| v.trim())
                .context("missing value")?;
            db.put(key, value.to_string())?;
            println!("OK");
        }
        "get" => match db.get(parse_key(words.next())?)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("NOT_FOUND"),
        },
        "del" | "delete" | "remove" => {
            db.remove(parse_key(words.next())?)?;
            println!("OK");
        }
        "range" => {
            let start = parse_key(words.next())?;
            let end = parse_key(words.next())?;
            let inclusive = !matches!(words.next(), Some("excl" | "exclusive"));
            let entries = db.range(start, end, inclusive)?;
            for (key, value) in &entries {
                println!("{}\t{}", key, String::from_utf8_lossy(value));
            }
            println!("({} entries)", entries.len());
        }
        "query" | "select" => {
            // a line starting with SELECT is the statement itself
            let statement = if cmd.eq_ignore_ascii_case("select") { line } else { rest };
            let response = db.execute_query(statement, params);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        "param" => {
            let name = words.next().context("missing parameter name")?;
            let value = words.collect::<Vec<_>>().join(" ");
            if value.is_empty() {
                bail!("missing value for parameter {}", name);
            }
            params.insert(name.to_string(), value);
            println!("OK");
        }
        "unparam" => {
            let name = words.next().context("missing parameter name")?;
            params.remove(name);
            println!("OK");
        }
        "sync" => {
            db.sync()?;
            println!("OK");
        }
        "flush" => {
            db.flush()?;
            println!("OK");
        }
        "compact" => {
            db.compact()?;
            println!("OK");
        }
        "stats" => println!("{}", serde_json::to_string_pretty(&db.stats())?),
        "help" | "?" => println!("{}", HELP),
        "quit" | "exit" => return Ok(Outcome::Quit),
        other => bail!("unknown command {:?}, try help", other),
    }
    Ok(Outcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stratadb_core::StorageConfig;
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path(), StorageConfig::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_keeps_spaces_in_value() {
        let (_dir, db) = open();
        let mut params = QueryParams::new();
        execute(&db, &mut params, "put 7 books|12.50|Product 7").unwrap();
        assert_eq!(db.get(7).unwrap(), Some(Bytes::from("books|12.50|Product 7")));

        execute(&db, &mut params, "del 7").unwrap();
        assert_eq!(db.get(7).unwrap(), None);
    }

    #[test]
    fn test_params_and_errors() {
        let (_dir, db) = open();
        let mut params = QueryParams::new();
        execute(&db, &mut params, "param max 15").unwrap();
        assert_eq!(params.get("max").map(String::as_str), Some("15"));
        execute(&db, &mut params, "unparam max").unwrap();
        assert!(params.is_empty());

        assert!(execute(&db, &mut params, "put x 1").is_err());
        assert!(execute(&db, &mut params, "put 1").is_err());
        assert!(execute(&db, &mut params, "frobnicate").is_err());
        assert!(matches!(
            execute(&db, &mut params, "quit").unwrap(),
            Outcome::Quit
        ));
    }
}
