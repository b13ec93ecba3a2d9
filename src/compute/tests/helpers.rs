use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::record::Record;
use crate::table::{TableManager, TableManagerConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A manager with the standard S / R / results triple under `dir`.
///
/// Returns the manager and the three table names.
pub fn pecj_setup(dir: &Path) -> (Arc<TableManager>, [String; 3]) {
    init_tracing();
    let tables = Arc::new(TableManager::new(TableManagerConfig::new(dir)).unwrap());
    let names = tables.create_pecj_tables("test_").unwrap();
    (tables, names)
}

/// A join input tuple as a record: the operator key rides the `key` tag,
/// the payload the `value` field.
pub fn tuple_record(ts: i64, key: i64, value: f64) -> Record {
    Record::scalar(ts, value)
        .with_tag("key", key.to_string())
        .with_field("value", value.to_string())
}
