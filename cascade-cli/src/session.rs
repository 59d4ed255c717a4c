use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use colored::Colorize;
use log::info;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use cascade_rs::object::{ObjectKey, Version, VersionedObject, CURRENT_VERSION, INVALID_VERSION};
use cascade_rs::store::ShardStore;

use crate::config::ConfigLoad;

/// Session and shard store cmd and running
pub struct Session {
    is_repl: bool,

    running: Arc<AtomicBool>,
    store: ShardStore<String>,

    settings: ConfigLoad,
}

impl Session {
    pub async fn try_new(
        settings: ConfigLoad,
        is_repl: bool,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        if is_repl {
            println!("Welcome to {}.", settings.get_prompt());
            println!("Opening shard at {:?}.", settings.get_storage_path());
            println!();
        }

        let store = ShardStore::open(&settings.to_shard_config())
            .map_err(|err| anyhow!("failed to open shard: {}", err))?;

        Ok(Self { is_repl, running, store, settings })
    }

    fn prompt(&self) -> String {
        format!("{} > ", self.settings.get_prompt())
    }

    pub async fn handle_repl(&mut self) {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(err) => {
                eprintln!("failed to start line editor: {}", err);
                return;
            }
        };
        rl.load_history(&get_history_path()).ok();

        'F: loop {
            if !self.running.load(Ordering::SeqCst) {
                break 'F;
            }

            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    let query = line.trim();
                    if query.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(query);
                    match self.handle_query(query) {
                        Ok(None) => break 'F,
                        Ok(Some(output)) => println!("{}", output),
                        Err(err) => eprintln!("{}", format!("error: {}", err).red()),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                }
                Err(ReadlineError::Eof) => break 'F,
                Err(err) => {
                    eprintln!("readline error: {}", err);
                    break 'F;
                }
            }
        }

        println!("Bye~");
        let _ = rl.save_history(&get_history_path());
    }

    /// Executes one query. `Ok(None)` means the session should end.
    pub fn handle_query(&mut self, query: &str) -> Result<Option<String>> {
        info!("handle query: {}", query);
        let started = Instant::now();

        let tokens: Vec<&str> = query.split_whitespace().collect();
        let mut output = match tokens.first().map(|t| t.to_ascii_lowercase()).as_deref() {
            None => return Ok(Some(String::new())),
            Some("exit") | Some("quit") => return Ok(None),
            Some("help") => Ok(help_text()),
            Some("put") => self.run_put(&tokens[1..]),
            Some("get") => self.run_get(&tokens[1..], false),
            Some("size") => self.run_get(&tokens[1..], true),
            Some("remove") => self.run_remove(&tokens[1..]),
            Some("list") => self.run_list(&tokens[1..]),
            Some("history") => self.run_history(&tokens[1..]),
            Some("status") => self.run_status(),
            Some("frontier") => self.run_frontier(),
            Some("settings") => Ok(format!("{:#?}", self.settings)),
            Some("set") => self.run_set(&tokens[1..]),
            Some(other) => Err(anyhow!("unknown command: {} (try 'help')", other)),
        }?;

        if self.is_repl && self.settings.is_show_stats() {
            output.push_str(&format!("\n({:.3?})", started.elapsed()));
        }
        Ok(Some(output))
    }

    fn run_put(&self, args: &[&str]) -> Result<String> {
        let (key, value) = match args {
            [key, value, ..] => (key.to_string(), value.as_bytes()),
            _ => return Err(anyhow!("usage: put <key> <value> [prev] [prev_by_key]")),
        };
        let mut object = VersionedObject::new(key, value);
        if let Some(prev) = args.get(2) {
            object.previous_version = prev.parse()?;
        }
        if let Some(prev_by_key) = args.get(3) {
            object.previous_version_by_key = prev_by_key.parse()?;
        }

        let (version, ts_us) = self.store.put(object).map_err(|err| anyhow!("{}", err))?;
        if version == INVALID_VERSION {
            Ok("rejected (stale previous version)".yellow().to_string())
        } else {
            Ok(format!("ok, version {} @ {}", version, format_ts(ts_us)))
        }
    }

    fn run_get(&self, args: &[&str], size_only: bool) -> Result<String> {
        let key = match args.first() {
            Some(key) => key.to_string(),
            None => return Err(anyhow!("usage: get <key> [version|@ts_us] [stable] [exact]")),
        };
        let mut version = CURRENT_VERSION;
        let mut by_time = None;
        let mut stable = self.settings.is_stable_reads();
        let mut exact = false;
        for arg in &args[1..] {
            match *arg {
                "stable" => stable = true,
                "unstable" => stable = false,
                "exact" => exact = true,
                arg if arg.starts_with('@') => by_time = Some(arg[1..].parse::<u64>()?),
                arg => version = arg.parse::<Version>()?,
            }
        }

        if size_only {
            let size = match by_time {
                Some(ts_us) => self.store.get_size_by_time(&key, ts_us, stable),
                None => self.store.get_size(&key, version, stable, exact),
            }
            .map_err(|err| anyhow!("{}", err))?;
            return Ok(format!("{} bytes", size));
        }

        let result = match by_time {
            Some(ts_us) => self.store.get_by_time(&key, ts_us, stable),
            None => self.store.get(&key, version, stable, exact),
        }
        .map_err(|err| anyhow!("{}", err))?;

        Ok(match result {
            None => "(null)".dimmed().to_string(),
            Some(obj) if obj.is_null() => format!(
                "(null) removed at version {} @ {}",
                obj.version,
                format_ts(obj.timestamp_us)
            ),
            Some(obj) => format!(
                "{}  [version {} @ {}]",
                String::from_utf8_lossy(obj.blob.as_slice()),
                obj.version,
                format_ts(obj.timestamp_us)
            ),
        })
    }

    fn run_remove(&self, args: &[&str]) -> Result<String> {
        let key = match args.first() {
            Some(key) => key.to_string(),
            None => return Err(anyhow!("usage: remove <key>")),
        };
        let (version, ts_us) = self.store.remove(&key).map_err(|err| anyhow!("{}", err))?;
        if version == INVALID_VERSION {
            Ok("no such key".yellow().to_string())
        } else {
            Ok(format!("removed, version {} @ {}", version, format_ts(ts_us)))
        }
    }

    fn run_list(&self, args: &[&str]) -> Result<String> {
        let mut prefix = "";
        let mut version = CURRENT_VERSION;
        let mut stable = self.settings.is_stable_reads();
        for arg in args {
            match *arg {
                "stable" => stable = true,
                arg if arg.parse::<Version>().is_ok() => version = arg.parse()?,
                arg => prefix = arg,
            }
        }

        let mut keys =
            self.store.list_keys(prefix, version, stable).map_err(|err| anyhow!("{}", err))?;
        keys.sort();
        if keys.is_empty() {
            Ok("(empty)".dimmed().to_string())
        } else {
            Ok(keys.join("\n"))
        }
    }

    fn run_history(&self, args: &[&str]) -> Result<String> {
        let key = match args.first() {
            Some(key) => key.to_string(),
            None => return Err(anyhow!("usage: history <key>")),
        };
        if !key.is_valid() {
            return Err(anyhow!("invalid key"));
        }

        let latest = self.store.status().map_err(|err| anyhow!("{}", err))?.latest_version;
        let mut lines = Vec::new();
        for version in 0..=latest {
            if let Some(obj) = self
                .store
                .get(&key, version, false, true)
                .map_err(|err| anyhow!("{}", err))?
            {
                if obj.is_null() {
                    lines.push(format!(
                        "version {:>6} @ {}  (removed)",
                        version,
                        format_ts(obj.timestamp_us)
                    ));
                } else {
                    lines.push(format!(
                        "version {:>6} @ {}  {} bytes",
                        version,
                        format_ts(obj.timestamp_us),
                        obj.blob.len()
                    ));
                }
            }
        }
        if lines.is_empty() {
            Ok("(no versions)".dimmed().to_string())
        } else {
            Ok(lines.join("\n"))
        }
    }

    fn run_status(&self) -> Result<String> {
        let status = self.store.status().map_err(|err| anyhow!("{}", err))?;
        Ok(format!(
            "{}\nlive keys:      {}\nlogical size:   {} bytes\nlog size:       {} bytes\ndeltas:         {}\nlatest version: {}",
            status.name, status.keys, status.size, status.disk_size, status.deltas, status.latest_version
        ))
    }

    fn run_frontier(&self) -> Result<String> {
        let snapshot = self.store.frontier_snapshot();
        Ok(format!(
            "local latest:      {}\nglobal stable:     {}\nglobal persistent: {}\nstable ts (us):    {}",
            snapshot.local_latest,
            snapshot.global_stable,
            snapshot.global_persistent,
            snapshot.global_stable_ts_ns / 1000
        ))
    }

    fn run_set(&mut self, args: &[&str]) -> Result<String> {
        match args {
            [name, value] => {
                self.settings.inject_cmd(name, value)?;
                Ok(format!("{} = {} (takes effect for new sessions where applicable)", name, value))
            }
            _ => Err(anyhow!("usage: set <name> <value>")),
        }
    }
}

fn format_ts(ts_us: u64) -> String {
    let secs = (ts_us / 1_000_000) as i64;
    let nanos = ((ts_us % 1_000_000) * 1_000) as u32;
    match chrono::DateTime::from_timestamp(secs, nanos) {
        Some(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        None => ts_us.to_string(),
    }
}

fn help_text() -> String {
    [
        "put <key> <value> [prev] [prev_by_key]  store a value",
        "get <key> [version|@ts_us] [stable] [exact]",
        "size <key> [version|@ts_us] [stable] [exact]",
        "remove <key>",
        "list [prefix] [version] [stable]",
        "history <key>",
        "status",
        "frontier",
        "settings | set <name> <value>",
        "exit",
    ]
    .join("\n")
}

fn get_history_path() -> String {
    format!(
        "{}/.cascli_history",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    )
}
