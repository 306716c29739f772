//! Structured logging setup, grounded on the teacher's `logging.rs`: an `EnvFilter` driven by
//! `RUST_LOG` (defaulting to `info`), writing through `tracing-appender`'s non-blocking
//! stderr writer. The returned `WorkerGuard` must be held for the lifetime of the process or
//! buffered log lines are dropped on exit.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init() -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .init();

    guard
}
