//! Logger and logging macros
//!
//! For the macros to properly compile, the calling crate must add a dependency to
//! crate log (ie. `log.workspace = true`).

use log::LevelFilter;
use log4rs::{config::Root, Config};

mod appender;
mod consts;
mod logger;

pub use consts::DEFAULT_LOGGER_ENV;
pub use logger::LogError;

use appender::AppenderSpec;
use consts::{ERR_LOG_FILE_NAME, LOG_FILE_NAME};

const CONSOLE_APPENDER: &str = "stdout";
const LOG_FILE_APPENDER: &str = "log_file";
const ERR_LOG_FILE_APPENDER: &str = "err_log_file";

pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Initializes the global logger with a console appender and, when `log_dir` is given,
/// a rolling log file plus a rolling error-only log file.
///
/// `filters` follows the `RUST_LOG` syntax, e.g. `info,vstate_pruner=debug`.
/// Values found in the `RUST_LOG` environment variable are applied first.
pub fn init_logger(log_dir: Option<&str>, filters: &str) -> Result<(), LogError> {
    let loggers =
        logger::Builder::new().root_level(LevelFilter::Info).parse_env(DEFAULT_LOGGER_ENV).parse_expression(filters).build();

    let mut specs = vec![AppenderSpec::console(CONSOLE_APPENDER, None)];
    if let Some(log_dir) = log_dir {
        specs.push(AppenderSpec::roller(LOG_FILE_APPENDER, None, log_dir, LOG_FILE_NAME)?);
        specs.push(AppenderSpec::roller(ERR_LOG_FILE_APPENDER, Some(LevelFilter::Warn), log_dir, ERR_LOG_FILE_NAME)?);
    }

    let names = specs.iter().map(|spec| spec.name).collect::<Vec<_>>();
    let appenders = specs.iter_mut().map(|spec| spec.appender()).collect::<Result<Vec<_>, _>>()?;
    let config = Config::builder()
        .appenders(appenders)
        .loggers(loggers.items())
        .build(Root::builder().appenders(names).build(loggers.root_level()))
        .map_err(|err| LogError::Config(err.to_string()))?;

    log4rs::init_config(config).map_err(|err| LogError::Init(err.to_string()))?;
    set_log_level(loggers.max_level());
    Ok(())
}

/// Tries to init the global logger, but does not fail if it was already setup.
/// Should be used for tests.
pub fn try_init_logger(filters: &str) {
    let loggers =
        logger::Builder::new().root_level(LevelFilter::Info).parse_env(DEFAULT_LOGGER_ENV).parse_expression(filters).build();
    let mut stdout = AppenderSpec::console(CONSOLE_APPENDER, None);
    let Ok(appender) = stdout.appender() else { return };
    if let Ok(config) = Config::builder()
        .appender(appender)
        .loggers(loggers.items())
        .build(Root::builder().appender(CONSOLE_APPENDER).build(loggers.root_level()))
    {
        let _ = log4rs::init_config(config);
    }
}

#[macro_export]
macro_rules! trace {
    ($($t:tt)*) => {
        log::trace!($($t)*);
    };
}

#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => (
        log::debug!($($t)*);
    )
}

#[macro_export]
macro_rules! info {
    ($($t:tt)*) => (
        log::info!($($t)*);
    )
}

#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => (
        log::warn!($($t)*);
    )
}

#[macro_export]
macro_rules! error {
    ($($t:tt)*) => (
        log::error!($($t)*);
    )
}
