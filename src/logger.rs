//! stderr 日志后端: `E 12:00:01.250 +0.013s block_cache   message`

use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct FsckLogger {
    started: DateTime<Local>,
}

impl Log for FsckLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let letter = match record.level() {
            Level::Error => 'E',
            Level::Warn => 'W',
            Level::Info => 'I',
            Level::Debug => 'D',
            Level::Trace => 'T',
        };
        let now = Local::now();
        let elapsed = (now - self.started).num_milliseconds() as f64 / 1000.0;
        let module = record.module_path().unwrap_or("");
        let idx = module.rfind("::").map_or(0, |i| i + 2);
        eprintln!(
            "{} {} +{:.3}s {:<12} {}",
            letter,
            now.format("%H:%M:%S%.3f"),
            elapsed,
            &module[idx..],
            record.args()
        );
    }

    fn flush(&self) {}
}

lazy_static! {
    static ref LOGGER: FsckLogger = FsckLogger {
        started: Local::now(),
    };
}

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&*LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// -v 的个数对应的日志级别
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
