use std::{fs::OpenOptions, io, path::Path, sync::Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// `verbose` forces debug output, otherwise `RUST_LOG` is honoured with an info fallback. When a
/// log file is given every event is also appended to it, without ANSI colors.
pub fn init(verbose: bool, log_file: Option<&Path>) -> io::Result<()> {
    let filter = || {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_thread_names(true).with_filter(filter()))
        .with(file_layer)
        .try_init()
        .map_err(|error| io::Error::new(io::ErrorKind::Other, error))
}
