use tracing_subscriber::EnvFilter;

use crate::compute::ComputeEngine;
use crate::table::IngestObserver;
use crate::window::{SchedulerConfig, TriggerPolicy, WindowScheduler, WindowType};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tumbling 1-second windows, time-based, zero slack and zero lateness.
pub fn tumbling_config() -> SchedulerConfig {
    init_tracing();
    SchedulerConfig {
        window_type: WindowType::Tumbling,
        window_len_us: 1_000_000,
        slide_len_us: 1_000_000,
        trigger: TriggerPolicy::TimeBased,
        watermark_slack_us: 0,
        max_delay_us: 0,
        ..SchedulerConfig::new("stream_s", "stream_r", "join_results")
    }
}

/// A scheduler over an uninitialized engine — trigger bookkeeping can be
/// driven and inspected without ever launching the dispatch loop.
pub fn detached_scheduler(config: SchedulerConfig) -> WindowScheduler {
    WindowScheduler::new(config, ComputeEngine::uninitialized()).unwrap()
}

/// Feed one S-side event.
pub fn event_s(scheduler: &WindowScheduler, ts: i64) {
    scheduler.on_data_inserted("stream_s", ts, 1);
}

/// Feed one R-side event.
pub fn event_r(scheduler: &WindowScheduler, ts: i64) {
    scheduler.on_data_inserted("stream_r", ts, 1);
}
