//! Log4rs setup: one console appender and one size-rolled file appender,
//! with per-module loggers for the crate itself plus the noisier
//! dependencies (`sea_orm`, `tokio`) pinned to a quieter floor than the
//! root.

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::{init_config, Config};

const LOGGING_PATTERN: &str = "[{d} {h({l})} {M}] {m}{n}";
const LOG_FILE_PATH: &str = "data/tspi.log";
const LOG_FILE_ROLLED_PATTERN: &str = "data/tspi.{}.log";
const LOG_FILE_MAX_BYTES: u64 = 5 * 1024 * 1024;
const LOG_FILE_ROLLED_COUNT: u32 = 8;

/// Sets up logging at the given threshold. A threshold of `Off` skips
/// initialisation entirely so tests and embedded callers never pay for a
/// log4rs config they don't want.
pub fn setup(level: LevelFilter) {
    if level == LevelFilter::Off {
        return;
    }

    let pattern = Box::new(PatternEncoder::new(LOGGING_PATTERN));
    let console = Box::new(ConsoleAppender::builder().encoder(pattern.clone()).build());

    let trigger = Box::new(SizeTrigger::new(LOG_FILE_MAX_BYTES));
    let roller = Box::new(
        FixedWindowRoller::builder()
            .build(LOG_FILE_ROLLED_PATTERN, LOG_FILE_ROLLED_COUNT)
            .expect("fixed window roller pattern is valid"),
    );
    let policy = Box::new(CompoundPolicy::new(trigger, roller));
    let file = Box::new(
        RollingFileAppender::builder()
            .encoder(pattern)
            .build(LOG_FILE_PATH, policy)
            .expect("unable to create rolling file appender"),
    );

    const APPENDERS: [&str; 2] = ["stdout", "file"];

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", console))
        .appender(Appender::builder().build("file", file))
        .logger(Logger::builder().appenders(APPENDERS).additive(false).build("tspi_relay", level))
        .logger(Logger::builder().build("sea_orm", LevelFilter::Warn))
        .logger(Logger::builder().build("tokio", LevelFilter::Warn))
        .build(Root::builder().appenders(APPENDERS).build(LevelFilter::Warn))
        .expect("failed to build logging config");

    init_config(config).expect("unable to initialise logger");
}
