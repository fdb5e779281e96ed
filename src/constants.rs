//! Constants and configuration values used throughout the ask-continue MCP server

use std::path::PathBuf;
use std::time::Duration;

/// Port the extension listens on when it has not written a registration record
pub const DEFAULT_EXTENSION_PORT: u16 = 23983;

/// First port the callback listener tries to bind
pub const CALLBACK_PORT_START: u16 = 23984;

/// How many consecutive ports to probe before giving up on binding
pub const MAX_PORT_PROBES: u16 = 50;

/// Per-candidate timeout for outbound `/ask` probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed backoff between dispatch rounds when every window reported busy
pub const BUSY_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Pause before the one-shot recovery retry, giving a live extension window
/// time to rewrite its registration record
pub const RECOVERY_DELAY: Duration = Duration::from_millis(500);

/// Bounded wait for the callback listener to come up at startup
pub const LISTENER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory name (under the OS temp dir) holding registration records
pub const REGISTRATION_DIR_NAME: &str = "ask-continue-ports";

/// File extension of a registration record
pub const REGISTRATION_EXTENSION: &str = "port";

/// Default log file name for development mode
pub const DEV_LOG_FILENAME: &str = "ask-continue-mcp.log";

/// Shared directory where extension windows register their listening ports
pub fn registration_dir() -> PathBuf {
    std::env::temp_dir().join(REGISTRATION_DIR_NAME)
}

/// Development log file path
pub fn dev_log_path() -> PathBuf {
    std::env::temp_dir().join(DEV_LOG_FILENAME)
}
