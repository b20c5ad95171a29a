pub mod serial;
pub mod device;
pub mod commands;
pub mod config;
pub mod provisioning;
pub mod telemetry;

use env_logger::Env;

/// Install a process-wide logger for hosts that do not bring their own.
/// `RUST_LOG` still wins over `default_level`. Safe to call more than once.
pub fn init_logging(default_level: &str) {
    let result = env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
    if result.is_ok() {
        log::info!("fieldlink {} logging initialized", env!("CARGO_PKG_VERSION"));
    }
}
