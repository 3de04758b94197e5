//! Environment overrides for configuration structs.
//!
//! ```ignore
//! let fifo_size: usize = env_get("SHM_FIFO_SIZE", 64);
//! let mode: HugetlbMode = env_get("SHM_HUGETLB_MODE", HugetlbMode::Try);
//! ```

use std::str::FromStr;

/// Reads `key` parsed as `T`, or returns `default` when unset.
///
/// A value that fails to parse is reported and ignored.
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                default
            }
        },
        Err(_) => default,
    }
}
