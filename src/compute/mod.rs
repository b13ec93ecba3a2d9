//! # Window-Join Compute Engine
//!
//! A stateless per-window executor: given a window id and its time range,
//! it reads both input stream tables, drives a pluggable join operator,
//! writes a summary record into the result table, and reports a
//! [`ComputeStatus`].  The engine holds no per-window state between calls
//! — everything a window needs is passed in or read from the tables.
//!
//! ## Operator plug-ins
//!
//! Operators are black boxes behind the [`JoinOperator`] trait
//! (see [`operators`]).  [`OperatorKind`] enumerates the known variants
//! and centralizes the kind → constructor mapping, so adding an operator
//! touches exactly one place.  The AQP support matrix is a property of
//! the kind, not of the instance.
//!
//! ## Tuples
//!
//! Records convert to operator tuples by parsing the `"key"` tag as an
//! integer (absent → 0) and the `"value"` field as a double (absent → 0).
//! The record timestamp serves as both event time and arrival time.
//!
//! ## Timeouts and AQP fallback
//!
//! When a window's synchronous execution exceeds the configured timeout
//! and the operator supports approximation with `enable_aqp` set, the
//! engine reports the approximate estimate with `used_aqp = true`.
//! Otherwise the call fails with a timeout error — and the engine stays
//! usable for the next window.

pub mod operators;
pub mod state;

#[cfg(test)]
mod tests;

pub use operators::{JoinOperator, OperatorTuple, build_operator};
pub use state::{ComputeState, ComputeStateManager, StateError};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::record::{Record, TimeRange};
use crate::resource::ResourceHandle;
use crate::table::{
    FIELD_AQP_ESTIMATE, FIELD_COMPUTATION_TIME_MS, FIELD_JOIN_COUNT, FIELD_MEMORY_USED_BYTES,
    FIELD_SELECTIVITY, FIELD_USED_AQP, TAG_ALGORITHM, TAG_WINDOW_ID, TableError, TableManager,
};

/// Bound of the rolling latency sample ring.
const LATENCY_RING_CAP: usize = 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compute-engine operations.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The engine was used before [`ComputeEngine::initialize`].
    #[error("Engine not initialized")]
    NotInitialized,

    /// The per-call window range is degenerate.
    #[error("invalid time range: {0}")]
    InvalidRange(String),

    /// The window exceeded the configured timeout and no AQP fallback
    /// applied.  The engine remains usable for the next window.
    #[error("window {window_id} timed out after {elapsed_ms:.1} ms (limit {limit_ms} ms)")]
    Timeout {
        /// The window that timed out.
        window_id: u64,
        /// Observed execution time.
        elapsed_ms: f64,
        /// Configured limit.
        limit_ms: u64,
    },

    /// The operator refused to start.
    #[error("operator failed to start")]
    OperatorStart,

    /// Error reaching the input or result tables.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// OperatorKind
// ------------------------------------------------------------------------------------------------

/// The known join-operator variants.
///
/// The enum is the single registry: the display name, the AQP support
/// matrix, and the factory dispatch all key off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// Incremental aggregate window join.
    Iawj,
    /// Mean-based approximate processing.
    MeanAqp,
    /// Incremental mean approximation.
    Ima,
    /// Multi-stream window join.
    Mswj,
    /// Learned (AI) join.
    Ai,
    /// Linear stochastic variational inference join.
    LinearSvi,
    /// IAWJ with selectivity estimation.
    IawjSel,
    /// Lazy IAWJ with selectivity estimation.
    LazyIawjSel,
    /// Symmetric hash join.
    Shj,
    /// Progressive relational join.
    Prj,
    /// Predictive error-compensated join.
    Pecj,
}

impl OperatorKind {
    /// Every known variant.
    pub const ALL: [OperatorKind; 11] = [
        OperatorKind::Iawj,
        OperatorKind::MeanAqp,
        OperatorKind::Ima,
        OperatorKind::Mswj,
        OperatorKind::Ai,
        OperatorKind::LinearSvi,
        OperatorKind::IawjSel,
        OperatorKind::LazyIawjSel,
        OperatorKind::Shj,
        OperatorKind::Prj,
        OperatorKind::Pecj,
    ];

    /// The operator-type tag written into result records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Iawj => "IAWJ",
            Self::MeanAqp => "MeanAQP",
            Self::Ima => "IMA",
            Self::Mswj => "MSWJ",
            Self::Ai => "AI",
            Self::LinearSvi => "LinearSVI",
            Self::IawjSel => "IAWJSel",
            Self::LazyIawjSel => "LazyIAWJSel",
            Self::Shj => "SHJ",
            Self::Prj => "PRJ",
            Self::Pecj => "PECJ",
        }
    }

    /// Parses an operator-type tag.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the variant advertises approximate query processing.
    pub fn supports_aqp(&self) -> bool {
        matches!(
            self,
            Self::MeanAqp | Self::Ima | Self::Mswj | Self::IawjSel | Self::LazyIawjSel | Self::Pecj
        )
    }
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration of one compute engine.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Window length, for informational reporting; the actual range
    /// arrives per call.
    pub window_len_us: i64,

    /// Slide length, forwarded to the operator.
    pub slide_len_us: i64,

    /// The operator variant to build per window.
    pub operator: OperatorKind,

    /// Name of the S input stream table.
    pub stream_s_table: String,

    /// Name of the R input stream table.
    pub stream_r_table: String,

    /// Name of the result table.
    pub result_table: String,

    /// S-side tuple buffer bound, forwarded to the operator.
    pub s_buffer_len: usize,

    /// R-side tuple buffer bound, forwarded to the operator.
    pub r_buffer_len: usize,

    /// Time step, forwarded to the operator.
    pub time_step_us: i64,

    /// Lateness tolerance, forwarded to the operator.
    pub max_delay_us: i64,

    /// Watermark slack, forwarded to the operator.
    pub watermark_slack_us: i64,

    /// Memory budget reported per window.
    pub max_memory_bytes: u64,

    /// Thread budget; bounds any operator-internal parallelism.
    pub max_threads: usize,

    /// Per-window timeout in milliseconds; 0 disables the check.
    pub timeout_ms: u64,

    /// When a window times out and the operator supports approximation,
    /// report the estimate instead of failing.
    pub enable_aqp: bool,

    /// Operator-specific toggles, passed through `set_config` verbatim.
    pub operator_options: HashMap<String, String>,
}

impl ComputeConfig {
    /// A config joining `stream_s` and `stream_r` into `result` with the
    /// given operator and sane defaults.
    pub fn new(
        operator: OperatorKind,
        stream_s_table: impl Into<String>,
        stream_r_table: impl Into<String>,
        result_table: impl Into<String>,
    ) -> Self {
        Self {
            window_len_us: 1_000_000,
            slide_len_us: 1_000_000,
            operator,
            stream_s_table: stream_s_table.into(),
            stream_r_table: stream_r_table.into(),
            result_table: result_table.into(),
            s_buffer_len: 4096,
            r_buffer_len: 4096,
            time_step_us: 1000,
            max_delay_us: 0,
            watermark_slack_us: 0,
            max_memory_bytes: 64 * 1024 * 1024,
            max_threads: 1,
            timeout_ms: 0,
            enable_aqp: false,
            operator_options: HashMap::new(),
        }
    }

    fn validate(&self) -> Result<(), ComputeError> {
        if self.window_len_us <= 0 {
            return Err(ComputeError::InvalidConfig("window_len_us must be positive".into()));
        }
        if self.stream_s_table.is_empty()
            || self.stream_r_table.is_empty()
            || self.result_table.is_empty()
        {
            return Err(ComputeError::InvalidConfig("table names must be non-empty".into()));
        }
        Ok(())
    }

    /// The flat key/value view handed to `JoinOperator::set_config`.
    fn operator_config(&self) -> HashMap<String, String> {
        let mut map = self.operator_options.clone();
        map.insert("s_buffer_len".into(), self.s_buffer_len.to_string());
        map.insert("r_buffer_len".into(), self.r_buffer_len.to_string());
        map.insert("time_step_us".into(), self.time_step_us.to_string());
        map.insert("max_delay_us".into(), self.max_delay_us.to_string());
        map.insert(
            "watermark_slack_us".into(),
            self.watermark_slack_us.to_string(),
        );
        map.insert("max_threads".into(), self.max_threads.to_string());
        map
    }
}

// ------------------------------------------------------------------------------------------------
// ComputeStatus
// ------------------------------------------------------------------------------------------------

/// The outcome of one window execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStatus {
    /// Whether the window completed.
    pub success: bool,

    /// The executed window.
    pub window_id: u64,

    /// Records read from the S input in the window range.
    pub input_s_count: u64,

    /// Records read from the R input in the window range.
    pub input_r_count: u64,

    /// Exact join count reported by the operator.
    pub join_count: u64,

    /// Approximate estimate, when the operator supports AQP.
    pub aqp_estimate: f64,

    /// Whether the reported result fell back to the AQP estimate.
    pub used_aqp: bool,

    /// `|exact − aqp| / max(exact, 1)` when an estimate was produced.
    pub aqp_error: f64,

    /// `join_count / (s_count × r_count)` when both inputs are non-empty.
    pub selectivity: f64,

    /// Wall-clock execution time in milliseconds.
    pub computation_time_ms: f64,

    /// Estimated memory used by the window, in bytes.
    pub memory_used_bytes: u64,

    /// Whether the execution exceeded the configured timeout.
    pub timeout_occurred: bool,

    /// Failure description when `success` is false.
    pub error: Option<String>,
}

impl ComputeStatus {
    /// A failure status for callbacks when execution returned an error.
    pub fn failure(window_id: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            window_id,
            input_s_count: 0,
            input_r_count: 0,
            join_count: 0,
            aqp_estimate: 0.0,
            used_aqp: false,
            aqp_error: 0.0,
            selectivity: 0.0,
            computation_time_ms: 0.0,
            memory_used_bytes: 0,
            timeout_occurred: false,
            error: Some(error.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

/// Rolling metrics maintained across windows.
#[derive(Debug, Default)]
struct ComputeMetrics {
    total_windows_completed: u64,
    failed_windows: u64,
    timeout_windows: u64,
    total_tuples_processed: u64,
    latencies_ms: VecDeque<f64>,
    selectivity_sum: f64,
    selectivity_samples: u64,
    peak_memory_bytes: u64,
    aqp_invocations: u64,
    aqp_error_sum: f64,
}

/// Snapshot of engine metrics returned by [`ComputeEngine::metrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeMetricsSnapshot {
    /// Windows that completed.
    pub total_windows_completed: u64,

    /// Windows that failed (timeouts included).
    pub failed_windows: u64,

    /// Windows that exceeded the timeout.
    pub timeout_windows: u64,

    /// Tuples fed to operators across all windows.
    pub total_tuples_processed: u64,

    /// Mean window latency over the sample ring, in milliseconds.
    pub avg_latency_ms: f64,

    /// Smallest sampled latency.
    pub min_latency_ms: f64,

    /// Largest sampled latency.
    pub max_latency_ms: f64,

    /// 99th-percentile sampled latency.
    pub p99_latency_ms: f64,

    /// Running mean of join selectivity.
    pub avg_join_selectivity: f64,

    /// Largest per-window memory estimate seen.
    pub peak_memory_bytes: u64,

    /// Number of AQP estimate computations.
    pub aqp_invocations: u64,

    /// Running mean of the AQP error rate.
    pub avg_aqp_error_rate: f64,
}

impl ComputeMetrics {
    fn record_success(&mut self, status: &ComputeStatus) {
        self.total_windows_completed += 1;
        self.total_tuples_processed += status.input_s_count + status.input_r_count;
        if self.latencies_ms.len() == LATENCY_RING_CAP {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(status.computation_time_ms);
        self.selectivity_sum += status.selectivity;
        self.selectivity_samples += 1;
        self.peak_memory_bytes = self.peak_memory_bytes.max(status.memory_used_bytes);
        if status.timeout_occurred {
            self.timeout_windows += 1;
        }
    }

    fn record_aqp(&mut self, error_rate: f64) {
        self.aqp_invocations += 1;
        self.aqp_error_sum += error_rate;
    }

    fn snapshot(&self) -> ComputeMetricsSnapshot {
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let (avg, min, max, p99) = if sorted.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: f64 = sorted.iter().sum();
            let p99_idx = ((sorted.len() as f64 * 0.99).ceil() as usize)
                .saturating_sub(1)
                .min(sorted.len() - 1);
            (
                sum / sorted.len() as f64,
                sorted[0],
                sorted[sorted.len() - 1],
                sorted[p99_idx],
            )
        };
        ComputeMetricsSnapshot {
            total_windows_completed: self.total_windows_completed,
            failed_windows: self.failed_windows,
            timeout_windows: self.timeout_windows,
            total_tuples_processed: self.total_tuples_processed,
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            p99_latency_ms: p99,
            avg_join_selectivity: if self.selectivity_samples > 0 {
                self.selectivity_sum / self.selectivity_samples as f64
            } else {
                0.0
            },
            peak_memory_bytes: self.peak_memory_bytes,
            aqp_invocations: self.aqp_invocations,
            avg_aqp_error_rate: if self.aqp_invocations > 0 {
                self.aqp_error_sum / self.aqp_invocations as f64
            } else {
                0.0
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ComputeEngine
// ------------------------------------------------------------------------------------------------

struct EngineState {
    config: ComputeConfig,
    tables: Arc<TableManager>,
    handle: Option<ResourceHandle>,
}

struct EngineShared {
    state: RwLock<Option<EngineState>>,
    metrics: Mutex<ComputeMetrics>,
}

/// The stateless per-window join executor.
///
/// Cheap to clone; all clones share state and metrics.
#[derive(Clone)]
pub struct ComputeEngine {
    shared: Arc<EngineShared>,
}

impl ComputeEngine {
    /// Creates an engine shell that fails every call until
    /// [`ComputeEngine::initialize`] replaces it.
    pub fn uninitialized() -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: RwLock::new(None),
                metrics: Mutex::new(ComputeMetrics::default()),
            }),
        }
    }

    /// Creates an initialized engine.
    ///
    /// The table names are held as weak lookups: the tables are resolved
    /// by name at each execution, so the manager stays the sole owner.
    pub fn initialize(
        config: ComputeConfig,
        tables: Arc<TableManager>,
        handle: Option<ResourceHandle>,
    ) -> Result<Self, ComputeError> {
        config.validate()?;
        info!(
            operator = %config.operator,
            s = %config.stream_s_table,
            r = %config.stream_r_table,
            result = %config.result_table,
            "compute engine initialized"
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                state: RwLock::new(Some(EngineState {
                    config,
                    tables,
                    handle,
                })),
                metrics: Mutex::new(ComputeMetrics::default()),
            }),
        })
    }

    /// Whether [`ComputeEngine::initialize`] has produced this engine.
    pub fn is_initialized(&self) -> bool {
        self.shared
            .state
            .read()
            .map(|state| state.is_some())
            .unwrap_or(false)
    }

    /// Submits a task onto the engine's resource handle; falls back to a
    /// dedicated thread when no handle was granted.
    ///
    /// Returns `false` iff a handle exists but has been invalidated.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let Ok(state) = self.shared.state.read() else {
            return false;
        };
        match state.as_ref().and_then(|s| s.handle.as_ref()) {
            Some(handle) => handle.submit_task(task),
            None => std::thread::Builder::new()
                .name("compute-task".into())
                .spawn(task)
                .is_ok(),
        }
    }

    /// Executes the join for one window.
    ///
    /// See the [module docs](self) for the full algorithm.  On success the
    /// returned status carries counts, selectivity, timings, and the AQP
    /// outcome; a summary record is written into the result table.
    pub fn execute_window_join(
        &self,
        window_id: u64,
        range: TimeRange,
    ) -> Result<ComputeStatus, ComputeError> {
        let state_guard = self
            .shared
            .state
            .read()
            .map_err(|_| ComputeError::Internal("engine state lock poisoned".into()))?;
        let Some(state) = state_guard.as_ref() else {
            return Err(ComputeError::NotInitialized);
        };
        if !range.is_valid() {
            return Err(ComputeError::InvalidRange(range.to_string()));
        }

        let config = &state.config;
        let started = Instant::now();

        // Input ranges.  The table query is inclusive on both ends; the
        // window is half-open, so records at exactly `end_us` are trimmed.
        let s_table = state.tables.get_stream_table(&config.stream_s_table)?;
        let r_table = state.tables.get_stream_table(&config.stream_r_table)?;
        let in_window = |record: &Record| record.timestamp < range.end_us;
        let s_records: Vec<Record> = s_table
            .query(TimeRange::new(range.start_us, range.end_us), None)?
            .into_iter()
            .filter(in_window)
            .collect();
        let r_records: Vec<Record> = r_table
            .query(TimeRange::new(range.start_us, range.end_us), None)?
            .into_iter()
            .filter(in_window)
            .collect();
        let input_s_count = s_records.len() as u64;
        let input_r_count = r_records.len() as u64;

        // Drive the operator: configure, start, feed S first then R (each
        // stream in ascending timestamp order), collect the result.
        let mut operator = build_operator(config.operator);
        if !operator.set_config(&config.operator_config()) {
            warn!(operator = %config.operator, "operator rejected its configuration");
        }
        operator.set_window(config.window_len_us, config.slide_len_us);
        operator.sync_time(range.start_us);
        if !operator.start() {
            return Err(ComputeError::OperatorStart);
        }

        for record in &s_records {
            operator.feed_tuple_s(record_to_tuple(record));
        }
        for record in &r_records {
            operator.feed_tuple_r(record_to_tuple(record));
        }

        let join_count = operator.get_result();

        let supports_aqp = config.operator.supports_aqp();
        let (aqp_estimate, aqp_error) = if supports_aqp {
            let estimate = operator.get_aqp_result();
            let error = (join_count as f64 - estimate).abs() / (join_count.max(1) as f64);
            (estimate, error)
        } else {
            (0.0, 0.0)
        };

        operator.stop();

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let timeout_occurred = config.timeout_ms > 0 && elapsed_ms > config.timeout_ms as f64;
        let used_aqp = timeout_occurred && config.enable_aqp && supports_aqp;

        if timeout_occurred && !used_aqp {
            if let Ok(mut metrics) = self.shared.metrics.lock() {
                metrics.timeout_windows += 1;
                metrics.failed_windows += 1;
            }
            return Err(ComputeError::Timeout {
                window_id,
                elapsed_ms,
                limit_ms: config.timeout_ms,
            });
        }

        let selectivity = if input_s_count > 0 && input_r_count > 0 {
            join_count as f64 / (input_s_count as f64 * input_r_count as f64)
        } else {
            0.0
        };
        let memory_used_bytes =
            (input_s_count + input_r_count) * std::mem::size_of::<OperatorTuple>() as u64;

        let status = ComputeStatus {
            success: true,
            window_id,
            input_s_count,
            input_r_count,
            join_count,
            aqp_estimate,
            used_aqp,
            aqp_error,
            selectivity,
            computation_time_ms: elapsed_ms,
            memory_used_bytes,
            timeout_occurred,
            error: None,
        };

        // Persist the per-window summary.  The join itself succeeded and
        // the source data stays queryable, so a write failure is surfaced
        // in the log rather than failing the window.
        if let Err(e) = Self::write_result(state, range, &status) {
            error!(window_id, error = %e, "result record write failed");
        }

        if let Ok(mut metrics) = self.shared.metrics.lock() {
            metrics.record_success(&status);
            if supports_aqp {
                metrics.record_aqp(aqp_error);
            }
        }

        debug!(
            window_id,
            s = input_s_count,
            r = input_r_count,
            join_count,
            elapsed_ms,
            "window join executed"
        );
        Ok(status)
    }

    /// Counts a failed window in the rolling metrics.  Called by the
    /// scheduler when an execution returns an error.
    pub fn record_failure(&self) {
        if let Ok(mut metrics) = self.shared.metrics.lock() {
            metrics.failed_windows += 1;
        }
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> ComputeMetricsSnapshot {
        self.shared
            .metrics
            .lock()
            .map(|metrics| metrics.snapshot())
            .unwrap_or_default()
    }

    /// Zeroes all metrics.  Tables are owned by the database and are not
    /// touched.
    pub fn reset(&self) {
        if let Ok(mut metrics) = self.shared.metrics.lock() {
            *metrics = ComputeMetrics::default();
        }
    }

    fn write_result(
        state: &EngineState,
        range: TimeRange,
        status: &ComputeStatus,
    ) -> Result<(), ComputeError> {
        let result_table = state.tables.get_join_result_table(&state.config.result_table)?;
        let record = Record::scalar(range.start_us, status.join_count as f64)
            .with_tag(TAG_WINDOW_ID, status.window_id.to_string())
            .with_tag(TAG_ALGORITHM, state.config.operator.name())
            .with_field(FIELD_JOIN_COUNT, status.join_count.to_string())
            .with_field(FIELD_SELECTIVITY, format!("{:.6}", status.selectivity))
            .with_field(
                FIELD_COMPUTATION_TIME_MS,
                format!("{:.3}", status.computation_time_ms),
            )
            .with_field(
                FIELD_MEMORY_USED_BYTES,
                status.memory_used_bytes.to_string(),
            )
            .with_field(FIELD_USED_AQP, status.used_aqp.to_string())
            .with_field(FIELD_AQP_ESTIMATE, format!("{:.3}", status.aqp_estimate));
        result_table.insert(record)?;
        Ok(())
    }
}

impl std::fmt::Debug for ComputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeEngine")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Converts a record into the operator tuple shape.
///
/// The record timestamp stands in for both event time and arrival time —
/// the source's explicit arrival-time field carries a different scale.
fn record_to_tuple(record: &Record) -> OperatorTuple {
    OperatorTuple {
        key: record.tag("key").and_then(|v| v.parse().ok()).unwrap_or(0),
        value: record
            .field("value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        event_time: record.timestamp,
        arrival_time: record.timestamp,
    }
}
