//! Default constants for tablet configuration
//!
//! These constants define the values used when a configuration file or
//! command line leaves a setting out.

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default log filter
pub const DEFAULT_LOG_LEVEL: &str = "info,pq_tablet=debug";

/// Maximum number of transactions a tablet keeps in flight
pub const DEFAULT_MAX_IN_FLIGHT_TXS: usize = 1000;

/// Default interval between periodic wake-ups in milliseconds (5 seconds)
pub const DEFAULT_WAKEUP_INTERVAL_MS: u64 = 5_000;

/// Default producer transaction timeout in milliseconds (15 minutes)
pub const DEFAULT_PRODUCER_TXN_TIMEOUT_MS: i64 = 900_000;

/// Grace delay added to the producer transaction timeout before a
/// supportive partition is reaped (1 hour)
pub const DEFAULT_PRODUCER_TXN_DELETE_DELAY_MS: i64 = 3_600_000;

/// First id handed out to supportive partitions
pub const DEFAULT_SUPPORTIVE_PARTITION_BASE: u32 = 100_000;
