use std::io::{stdin, BufRead, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use human_panic::setup_panic;
use log::info;

use cascade_cli::config::ConfigLoad;
use cascade_cli::{session, trace};

#[derive(Debug, Parser, PartialEq)]
#[command(version)]
// disable default help flag since it would conflict with subcommand parsing
#[command(author, about, disable_help_flag = true)]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    #[clap(long, help = "Print help information")]
    help: bool,

    /// Configuration file path, default 'config/cascadedb.toml'
    #[clap(
        short = 'c',
        long = "config",
        help = "Configuration file path",
        default_value = "config/cascadedb.toml"
    )]
    config: String,

    /// quiet model, No output printed to stdout
    #[clap(long = "quiet", short = 'q', default_value = "false")]
    quiet: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short = 'n', long, help = "Force non-interactive mode", default_value = "false")]
    non_interactive: bool,

    #[clap(long, require_equals = true, help = "Query to execute")]
    query: Option<String>,
}

/// CMD like:
///     cascli                     ==>  REPL against the local shard
///     cascli --query="status"    ==>  one shot, print and exit
///
#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic!();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.cascli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("cascli start args: {:?}", &args);

    if args.help {
        Args::command().print_help()?;
        return Ok(());
    }

    let mut cfg = match ConfigLoad::new(args.config.as_ref()) {
        Ok(cfg) => cfg,
        Err(_) => ConfigLoad::default(),
    };
    if args.debug {
        println!("{:?}", &cfg);
        eprintln!();
    }
    info!("cascli start config: {:?}", &cfg);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let is_terminal = stdin().is_terminal();
    let is_repl = is_terminal && !args.non_interactive && args.query.is_none();
    if is_repl {
        cfg.terminal_update();
    }

    let mut session = session::Session::try_new(cfg, is_repl, running.clone()).await?;

    if is_repl {
        eprintln!();
        eprintln!(" ██████  █████  ███████  ██████  █████  ██████  ███████");
        eprintln!("██      ██   ██ ██      ██      ██   ██ ██   ██ ██");
        eprintln!("██      ███████ ███████ ██      ███████ ██   ██ █████");
        eprintln!("██      ██   ██      ██ ██      ██   ██ ██   ██ ██");
        eprintln!(" ██████ ██   ██ ███████  ██████ ██   ██ ██████  ███████  KV Storage CLI");
        eprintln!();

        session.handle_repl().await;
        return Ok(());
    }

    if let Some(query) = args.query {
        for part in query.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            match session.handle_query(part)? {
                Some(output) => {
                    if !args.quiet {
                        println!("{}", output);
                    }
                }
                None => break,
            }
        }
        return Ok(());
    }

    // Piped input: one query per line.
    for line in stdin().lock().lines() {
        let line = line?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        match session.handle_query(query)? {
            Some(output) => {
                if !args.quiet {
                    println!("{}", output);
                }
            }
            None => break,
        }
    }

    Ok(())
}
