//! Logging helpers
//!
//! The engine logs through the `log` facade; these functions install
//! `env_logger` as the backend, either on stderr or on any byte sink.

use std::io::Write;

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    env_logger::init_from_env(env);
}

/// Initialize the logging system writing into `sink`
///
/// Returns `false` if a logger was already installed.
pub fn init_logger_with_sink(level: &str, sink: Box<dyn Write + Send>) -> bool {
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(sink))
        .try_init()
        .is_ok()
}
