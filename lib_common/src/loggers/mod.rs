/// Installs the `fern` backed global logger and rotates old log files.
pub mod loggersetup;

pub use loggersetup::{parse_level, rotate_logs, setup_logging, LoggerSetupError};
