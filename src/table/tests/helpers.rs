use tracing_subscriber::EnvFilter;

use crate::record::Record;
use crate::table::TableConfig;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default config with a buffer large enough to keep tests in memory.
pub fn test_config() -> TableConfig {
    init_tracing();
    TableConfig {
        memtable_max_bytes: 64 * 1024,
        ..TableConfig::default()
    }
}

/// A tagged sensor reading.
pub fn reading(ts: i64, sensor: &str, value: f64) -> Record {
    Record::scalar(ts, value)
        .with_tag("sensor", sensor)
        .with_field("value", value.to_string())
}
