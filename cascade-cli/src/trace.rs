use std::io::BufWriter;
use std::io::Write;
use std::str::FromStr;

use anyhow::Result;
use log::LevelFilter;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;

const MAX_LOG_FILES: usize = 10;
const FILE_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Initializes logging: everything at `level` and above goes to
/// daily-rolling files under `dir`, and warnings and errors are echoed to
/// stderr so a REPL user sees them without tailing the log. The returned
/// guards keep the non-blocking writer flushing; hold them for the life of
/// the process.
#[allow(dyn_drop)]
pub async fn init_logging(
    dir: &str,
    level: &str,
) -> Result<Vec<Box<dyn Drop + Send + Sync + 'static>>> {
    let mut guards: Vec<Box<dyn Drop + Send + Sync + 'static>> = Vec::new();

    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cascli.log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    let (non_blocking, flush_guard) = tracing_appender::non_blocking(rolling);
    guards.push(Box::new(flush_guard));

    let dispatch_file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::from_str(level)?)
        .chain(Box::new(BufWriter::with_capacity(FILE_BUFFER_BYTES, non_blocking))
            as Box<dyn Write + Send>);

    // Warnings reach the terminal directly; the store warns on things a
    // user should react to, like reads at a future timestamp.
    let dispatch_stderr = fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!(
                "\x1B[{}m{}: {}\x1B[0m",
                fern::colors::Color::Yellow.to_fg_str(),
                record.level().to_string().to_lowercase(),
                message
            ))
        })
        .chain(std::io::stderr());

    if fern::Dispatch::new()
        .chain(dispatch_file)
        .chain(dispatch_stderr)
        .apply()
        .is_err()
    {
        eprintln!("logger has already been set");
        return Ok(Vec::new());
    }

    Ok(guards)
}
