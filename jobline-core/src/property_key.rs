//! Recognized job parameter and job property keys
//!
//! Job parameters win over job properties of the same name.

/// Restart gate: `strict`, `force` or `detect`
pub const RESTART_MODE: &str = "jobline.restart.mode";

/// Seconds a split waits for its flows; absent waits indefinitely
pub const SPLIT_TIMEOUT_SECONDS: &str = "jobline.split.timeout.seconds";

/// Seconds a partitioned step waits for its partitions; absent waits indefinitely
pub const PARTITION_TIMEOUT_SECONDS: &str = "jobline.partition.timeout.seconds";

/// Advisory: collaborators manage their own transactions
pub const LOCAL_TX: &str = "jobline.local-tx";

/// Advisory: partition analyzer calls run outside a transaction
pub const ANALYZER_TX_DISABLED: &str = "jobline.analyzer.txDisabled";

/// Element to resume from on restart, overriding the recorded position
pub const RESTART_POSITION: &str = "jobline.restart.position";

/// Permit revisiting an element within one walk
pub const LOOP_ALLOWED: &str = "jobline.loop.allowed";

pub const RESTART_MODE_STRICT: &str = "strict";
pub const RESTART_MODE_FORCE: &str = "force";
pub const RESTART_MODE_DETECT: &str = "detect";

pub const ALL: [&str; 7] = [
    RESTART_MODE,
    SPLIT_TIMEOUT_SECONDS,
    PARTITION_TIMEOUT_SECONDS,
    LOCAL_TX,
    ANALYZER_TX_DISABLED,
    RESTART_POSITION,
    LOOP_ALLOWED,
];

/// Whether a key belongs to the engine rather than to user logic
pub fn is_reserved(key: &str) -> bool {
    ALL.contains(&key)
}
