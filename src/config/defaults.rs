//! Default configuration values
//!
//! Single source of truth for the engine's defaults.

use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LOCALRELAY";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "relays.json";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Weight given to a destination without `lb_weight`
pub const LOAD_BALANCE_WEIGHT: u32 = 100;

/// Transfer buffer used by each direction of a stream relay
pub const TRANSFER_BUFFER_SIZE: usize = 128;

/// Largest UDP payload a session can carry in one datagram
pub const DATAGRAM_BUFFER_SIZE: usize = 65_507;

/// Number of dial durations kept for the moving average
pub const DIAL_SAMPLES: usize = 10;

/// Longest relay name accepted
pub const MAX_NAME_LEN: usize = 64;

/// Default timeout for direct dials
pub fn dial_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Largest request body held in memory to replay through several proxies
pub const REPLAY_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Default idle period after which a UDP session is closed
pub fn udp_session_idle() -> Duration {
    Duration::from_secs(60)
}

/// Default bound on reading an HTTP request's headers
pub fn http_header_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Relays use ordered failover unless load balancing is switched on
pub fn load_balance() -> bool {
    false
}
