use std::env;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logger() -> impl Drop {
    // Tracing level from `TRACING_LEVEL`, defaulting to `info`.
    let default_filter = "info";
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| default_filter.to_string());
    let filter_layer = EnvFilter::new(filter);

    // Log file path from `LOG_FILE_PATH`, defaulting to `./logs/physioseg.log`.
    let default_log_path = "./logs/physioseg.log";
    let log_file_path = env::var("LOG_FILE_PATH").unwrap_or_else(|_| default_log_path.to_string());

    let file_appender = tracing_appender::rolling::never("./", log_file_path);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(false)
                .pretty()
                .without_time()
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(filter_layer)
        .init();

    info!("Tracing is configured for stdout and file logging.");

    guard
}
