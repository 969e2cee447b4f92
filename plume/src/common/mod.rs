pub(crate) mod snowflake;
pub mod value;

pub use value::Value;

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// doc constants
pub const DOC_ID: &str = "_id";

// datafile record markers
pub const DELETED_MARKER: &str = "$$deleted";
pub const INDEX_CREATED_MARKER: &str = "$$indexCreated";
pub const INDEX_REMOVED_MARKER: &str = "$$indexRemoved";

/// Path separator for addressing embedded fields, e.g. `location.city`.
pub const FIELD_SEPARATOR: char = '.';

/// Share of corrupt datafile lines tolerated at load time before the
/// load is aborted.
pub const DEFAULT_CORRUPT_ALERT_THRESHOLD: f64 = 0.1;

pub type Atomic<T> = Arc<RwLock<T>>;

#[inline]
pub fn atomic<T>(t: T) -> Atomic<T> {
    Arc::new(RwLock::new(t))
}

/// Current time in milliseconds since the Unix epoch, or zero when the
/// system clock reports a time before the epoch.
pub fn get_current_time_or_zero() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|err| {
            log::warn!("System clock is before the Unix epoch: {}", err);
            0
        })
}
