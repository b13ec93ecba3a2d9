use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::lsm::{LsmConfig, LsmTree};
use crate::record::Record;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config large enough that nothing flushes unless asked to.
pub fn memtable_only_config(dir: &Path) -> LsmConfig {
    init_tracing();
    LsmConfig {
        data_dir: dir.to_path_buf(),
        memtable_max_bytes: 64 * 1024,
        max_levels: 4,
        l0_compaction_trigger: 4,
        level_base_bytes: 1024 * 1024,
    }
}

/// Tiny memtable so puts rotate and flush quickly.
pub fn small_buffer_config(dir: &Path) -> LsmConfig {
    init_tracing();
    LsmConfig {
        data_dir: dir.to_path_buf(),
        memtable_max_bytes: 512,
        max_levels: 4,
        l0_compaction_trigger: 3,
        level_base_bytes: 1024,
    }
}

/// A scalar record with a deterministic tag and field payload.
pub fn sample(ts: i64, value: f64) -> Record {
    Record::scalar(ts, value)
        .with_tag("sensor", format!("temp_{}", ts.rem_euclid(3)))
        .with_field("raw", value.to_string())
}

/// Opens a tree, inserts `count` records at `ts = base + i * step`, and
/// returns it.
pub fn tree_with(config: LsmConfig, base: i64, step: i64, count: i64) -> LsmTree {
    let tree = LsmTree::open(config).unwrap();
    for i in 0..count {
        tree.put(sample(base + i * step, i as f64)).unwrap();
    }
    tree
}
