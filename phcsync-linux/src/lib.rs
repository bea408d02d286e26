pub mod bus;
pub mod clock;
pub mod config;
pub mod observer;
pub mod poller;
pub mod ports;
pub mod socket;

use thiserror::Error;
use tracing_log::AsTrace;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("could not forward log records: {0}")]
    Log(#[from] log::SetLoggerError),
    #[error("could not install the log subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global logger, printing everything at `level` or above to
/// stdout
pub fn setup_logger(level: log::LevelFilter) -> Result<(), LoggerError> {
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_log::LogTracer::init_with_filter(level)?;

    tracing_subscriber::fmt()
        .with_max_level(level.as_trace())
        .with_target(true)
        .finish()
        .try_init()?;

    Ok(())
}
