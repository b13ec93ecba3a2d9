//! # Window Scheduler
//!
//! Converts ingestion notifications into window-execution tasks.  The
//! scheduler watches the two input stream tables, advances a monotonic
//! watermark from observed event times, tracks per-window statistics,
//! and — when a window's trigger predicate fires — hands the window to
//! the compute engine.
//!
//! ## Window lifecycle
//!
//! ```text
//! Created → Accepting → Ready → Executing → Completed | Failed
//! ```
//!
//! Transitions are monotonic; a Completed window is never re-executed.
//!
//! ## Watermark
//!
//! One monotonic value per scheduler: `largest observed event time −
//! max_delay_us`.  It only ever increases, and advancing it is the sole
//! mechanism that makes time-based windows eligible.
//!
//! ## Trigger policies
//!
//! - **TimeBased** — `watermark ≥ window end + slack`.
//! - **CountBased** — `s_count + r_count ≥ threshold`.
//! - **Hybrid** — either of the above.
//! - **Manual** — never auto-triggers; [`WindowScheduler::schedule_window`]
//!   and [`WindowScheduler::trigger_pending_windows`] are the only entry
//!   points.
//!
//! ## Main loop
//!
//! One dedicated thread waits on a condition variable with the configured
//! trigger interval as timeout.  On wake it drains the ready queue
//! (ordered by window id) up to the concurrency bound, launching each
//! window through the compute engine's resource handle, and cleans up
//! completed windows past their retention.  Completion callbacks are
//! caught and counted, never propagated.

#[cfg(test)]
mod tests;

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashSet},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::compute::{ComputeEngine, ComputeStatus};
use crate::record::TimeRange;
use crate::table::IngestObserver;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A window cannot accept the requested transition.
    #[error("invalid window operation: {0}")]
    InvalidWindow(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Window model
// ------------------------------------------------------------------------------------------------

/// How window boundaries derive from event timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Disjoint fixed-length windows.
    Tumbling,

    /// Overlapping windows advancing by the slide length.
    Sliding,

    /// Gap-terminated windows that merge on continued activity.
    Session,
}

/// When a window becomes eligible for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Watermark-driven.
    TimeBased,

    /// Record-count-driven.
    CountBased,

    /// Either of the above.
    Hybrid,

    /// Only explicit scheduling triggers.
    Manual,
}

/// Lifecycle state of a window.  Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Just materialized; no statistics yet.
    Created,

    /// Receiving statistics updates.
    Accepting,

    /// Trigger condition met; queued for execution.
    Ready,

    /// Compute engine running.
    Executing,

    /// Finished successfully.  Terminal.
    Completed,

    /// Finished with an error.  Terminal.
    Failed,
}

/// Internal window bookkeeping.
#[derive(Debug, Clone)]
struct Window {
    id: u64,
    range: TimeRange,
    state: WindowState,
    s_count: u64,
    r_count: u64,
    submitted_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl Window {
    fn new(id: u64, range: TimeRange) -> Self {
        Self {
            id,
            range,
            state: WindowState::Created,
            s_count: 0,
            r_count: 0,
            submitted_at: None,
            completed_at: None,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, WindowState::Created | WindowState::Accepting)
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            id: self.id,
            range: self.range,
            state: self.state,
            s_count: self.s_count,
            r_count: self.r_count,
        }
    }
}

/// Read-only view of a window handed to callbacks and inspection APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Window id.
    pub id: u64,

    /// Half-open time range.
    pub range: TimeRange,

    /// Lifecycle state at snapshot time.
    pub state: WindowState,

    /// S-side records observed.
    pub s_count: u64,

    /// R-side records observed.
    pub r_count: u64,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration of one [`WindowScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Boundary derivation.
    pub window_type: WindowType,

    /// Window length in microseconds.
    pub window_len_us: i64,

    /// Slide length in microseconds (sliding windows only).
    pub slide_len_us: i64,

    /// Eligibility policy.
    pub trigger: TriggerPolicy,

    /// Grace added to a window's end before it is time-eligible.
    pub watermark_slack_us: i64,

    /// Total S+R records required under the count-based policy.
    pub trigger_count_threshold: u64,

    /// Subtracted from the largest observed event time to obtain the
    /// watermark — the out-of-order lateness tolerance.
    pub max_delay_us: i64,

    /// Upper bound on simultaneously executing windows.
    pub max_concurrent_windows: usize,

    /// Main-loop wake interval in microseconds.
    pub trigger_interval_us: u64,

    /// How long completed windows are retained before cleanup.
    pub retention: Duration,

    /// Name of the S input stream table.
    pub stream_s_table: String,

    /// Name of the R input stream table.
    pub stream_r_table: String,

    /// Name of the result table (informational; the engine owns writes).
    pub result_table: String,
}

impl SchedulerConfig {
    /// A tumbling, time-based config joining `stream_s` and `stream_r`.
    pub fn new(
        stream_s_table: impl Into<String>,
        stream_r_table: impl Into<String>,
        result_table: impl Into<String>,
    ) -> Self {
        Self {
            window_type: WindowType::Tumbling,
            window_len_us: 1_000_000,
            slide_len_us: 1_000_000,
            trigger: TriggerPolicy::TimeBased,
            watermark_slack_us: 0,
            trigger_count_threshold: 0,
            max_delay_us: 0,
            max_concurrent_windows: 4,
            trigger_interval_us: 10_000,
            retention: Duration::from_secs(300),
            stream_s_table: stream_s_table.into(),
            stream_r_table: stream_r_table.into(),
            result_table: result_table.into(),
        }
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        if self.window_len_us <= 0 {
            return Err(SchedulerError::InvalidConfig(
                "window_len_us must be positive".into(),
            ));
        }
        if self.window_type == WindowType::Sliding && self.slide_len_us <= 0 {
            return Err(SchedulerError::InvalidConfig(
                "slide_len_us must be positive for sliding windows".into(),
            ));
        }
        if self.max_concurrent_windows == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent_windows must be positive".into(),
            ));
        }
        if self.trigger_interval_us == 0 {
            return Err(SchedulerError::InvalidConfig(
                "trigger_interval_us must be positive".into(),
            ));
        }
        if self.trigger == TriggerPolicy::CountBased && self.trigger_count_threshold == 0 {
            return Err(SchedulerError::InvalidConfig(
                "trigger_count_threshold must be positive for count-based triggering".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

/// Snapshot of scheduler metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    /// Windows materialized.
    pub windows_created: u64,

    /// Windows whose trigger predicate fired.
    pub windows_triggered: u64,

    /// Windows completed successfully.
    pub windows_completed: u64,

    /// Windows that failed.
    pub windows_failed: u64,

    /// Callback invocations that panicked (caught and counted).
    pub callback_errors: u64,

    /// Completed windows removed by retention cleanup.
    pub windows_cleaned_up: u64,

    /// Current watermark (`i64::MIN` before the first event).
    pub watermark: i64,

    /// Largest event time observed.
    pub largest_event_time: i64,
}

// ------------------------------------------------------------------------------------------------
// Scheduler internals
// ------------------------------------------------------------------------------------------------

type WindowCallback = Box<dyn Fn(&WindowSnapshot, &ComputeStatus) + Send + Sync>;

#[derive(Default)]
struct CallbackSet {
    completed: Vec<WindowCallback>,
    failed: Vec<WindowCallback>,
}

#[derive(Default)]
struct Counters {
    windows_created: u64,
    windows_triggered: u64,
    windows_completed: u64,
    windows_failed: u64,
    windows_cleaned_up: u64,
}

struct SchedState {
    windows: BTreeMap<u64, Window>,
    ready: BinaryHeap<Reverse<u64>>,
    executing: HashSet<u64>,
    watermark: i64,
    largest_event: i64,
    next_session_id: u64,
    counters: Counters,
}

struct SchedShared {
    config: SchedulerConfig,
    engine: ComputeEngine,
    state: Mutex<SchedState>,
    cvar: Condvar,
    stop: AtomicBool,
    callbacks: Mutex<CallbackSet>,
    callback_errors: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// WindowScheduler
// ------------------------------------------------------------------------------------------------

/// Watches tables, advances the watermark, and dispatches eligible
/// windows to the compute engine.
pub struct WindowScheduler {
    shared: Arc<SchedShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WindowScheduler {
    /// Creates a scheduler over the given engine.  Call
    /// [`WindowScheduler::start`] to launch the dispatch loop.
    pub fn new(config: SchedulerConfig, engine: ComputeEngine) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(SchedShared {
                config,
                engine,
                state: Mutex::new(SchedState {
                    windows: BTreeMap::new(),
                    ready: BinaryHeap::new(),
                    executing: HashSet::new(),
                    watermark: i64::MIN,
                    largest_event: i64::MIN,
                    next_session_id: 0,
                    counters: Counters::default(),
                }),
                cvar: Condvar::new(),
                stop: AtomicBool::new(false),
                callbacks: Mutex::new(CallbackSet::default()),
                callback_errors: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Launches the dispatch loop.  Idempotent.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| SchedulerError::Internal("worker mutex poisoned".into()))?;
        if worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("window-scheduler".into())
            .spawn(move || Self::worker_loop(shared))
            .map_err(|e| SchedulerError::Internal(format!("worker spawn failed: {e}")))?;
        *worker = Some(handle);
        info!("window scheduler started");
        Ok(())
    }

    /// Requests termination.  With `wait_completion`, blocks until no
    /// window is executing; in-flight windows are never cancelled.
    pub fn stop(&self, wait_completion: bool) -> Result<(), SchedulerError> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cvar.notify_all();

        let handle = self
            .worker
            .lock()
            .map_err(|_| SchedulerError::Internal("worker mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if wait_completion {
            let mut state = self.lock_state()?;
            while !state.executing.is_empty() {
                state = self
                    .shared
                    .cvar
                    .wait_timeout(state, Duration::from_millis(50))
                    .map_err(|_| SchedulerError::Internal("state lock poisoned".into()))?
                    .0;
            }
        }
        info!("window scheduler stopped");
        Ok(())
    }

    /// Registers a completion callback.  Exceptions raised inside it are
    /// caught and counted, never propagated.
    pub fn on_window_completed(
        &self,
        callback: impl Fn(&WindowSnapshot, &ComputeStatus) + Send + Sync + 'static,
    ) {
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.completed.push(Box::new(callback));
        }
    }

    /// Registers a failure callback.
    pub fn on_window_failed(
        &self,
        callback: impl Fn(&WindowSnapshot, &ComputeStatus) + Send + Sync + 'static,
    ) {
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.failed.push(Box::new(callback));
        }
    }

    /// Registers this scheduler as an observer of `table`.
    pub fn watch(self: &Arc<Self>, table: &crate::table::StreamTable) {
        let trait_arc: Arc<dyn IngestObserver> = self.clone();
        let weak: std::sync::Weak<dyn IngestObserver> = Arc::downgrade(&trait_arc);
        table.register_observer(weak);
    }

    /// Explicitly materializes and readies a window.  The only trigger
    /// path under the manual policy.
    ///
    /// Fails when the id already belongs to a window that is executing or
    /// terminal — a Completed window is never re-executed.
    pub fn schedule_window(&self, id: u64, range: TimeRange) -> Result<(), SchedulerError> {
        if !range.is_valid() {
            return Err(SchedulerError::InvalidWindow(format!(
                "degenerate range {range}"
            )));
        }
        let mut state = self.lock_state()?;
        match state.windows.get(&id) {
            Some(window) if !window.is_open() => {
                return Err(SchedulerError::InvalidWindow(format!(
                    "window {id} is {:?} and cannot be re-scheduled",
                    window.state
                )));
            }
            Some(_) => {}
            None => {
                state.windows.insert(id, Window::new(id, range));
                state.counters.windows_created += 1;
            }
        }
        Self::mark_ready(&mut state, id);
        drop(state);
        self.shared.cvar.notify_all();
        Ok(())
    }

    /// Readies every open window.  Returns how many became eligible.
    pub fn trigger_pending_windows(&self) -> Result<usize, SchedulerError> {
        let mut state = self.lock_state()?;
        let open: Vec<u64> = state
            .windows
            .values()
            .filter(|w| w.is_open())
            .map(|w| w.id)
            .collect();
        for id in &open {
            Self::mark_ready(&mut state, *id);
        }
        drop(state);
        if !open.is_empty() {
            self.shared.cvar.notify_all();
        }
        Ok(open.len())
    }

    /// Number of currently executing windows.
    pub fn active_window_count(&self) -> usize {
        self.lock_state().map(|s| s.executing.len()).unwrap_or(0)
    }

    /// Current watermark (`i64::MIN` before the first event).
    pub fn watermark(&self) -> i64 {
        self.lock_state().map(|s| s.watermark).unwrap_or(i64::MIN)
    }

    /// State of one window, if it exists.
    pub fn window_state(&self, id: u64) -> Option<WindowState> {
        self.lock_state()
            .ok()
            .and_then(|s| s.windows.get(&id).map(|w| w.state))
    }

    /// Snapshots of all known windows, ordered by id.
    pub fn windows(&self) -> Vec<WindowSnapshot> {
        self.lock_state()
            .map(|s| s.windows.values().map(Window::snapshot).collect())
            .unwrap_or_default()
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> SchedulerMetrics {
        let Ok(state) = self.lock_state() else {
            return SchedulerMetrics::default();
        };
        SchedulerMetrics {
            windows_created: state.counters.windows_created,
            windows_triggered: state.counters.windows_triggered,
            windows_completed: state.counters.windows_completed,
            windows_failed: state.counters.windows_failed,
            callback_errors: self.shared.callback_errors.load(Ordering::Relaxed),
            windows_cleaned_up: state.counters.windows_cleaned_up,
            watermark: state.watermark,
            largest_event_time: state.largest_event,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Ingestion handling
    // --------------------------------------------------------------------------------------------

    fn handle_insert(&self, table_name: &str, ts: i64, count: usize) {
        let config = &self.shared.config;
        let is_s = table_name == config.stream_s_table;
        let is_r = table_name == config.stream_r_table;
        if !is_s && !is_r {
            return;
        }

        let Ok(mut state) = self.lock_state() else {
            return;
        };

        state.largest_event = state.largest_event.max(ts);
        let candidate = state.largest_event.saturating_sub(config.max_delay_us);
        let advanced = candidate > state.watermark;
        if advanced {
            state.watermark = candidate;
            trace!(watermark = candidate, "watermark advanced");
        }

        let touched = self.windows_for_timestamp(&mut state, ts);
        for id in &touched {
            if let Some(window) = state.windows.get_mut(id) {
                if is_s {
                    window.s_count += count as u64;
                } else {
                    window.r_count += count as u64;
                }
                if window.state == WindowState::Created {
                    window.state = WindowState::Accepting;
                }
            }
        }

        let mut newly_ready = false;
        for id in &touched {
            newly_ready |= Self::evaluate_trigger(config, &mut state, *id);
        }
        if advanced {
            // A higher watermark can make windows eligible that saw no
            // event in this notification.
            let open: Vec<u64> = state
                .windows
                .values()
                .filter(|w| w.is_open())
                .map(|w| w.id)
                .collect();
            for id in open {
                newly_ready |= Self::evaluate_trigger(config, &mut state, id);
            }
        }

        drop(state);
        if newly_ready {
            self.shared.cvar.notify_all();
        }
    }

    /// Materializes (creating as needed) every window containing `ts` and
    /// returns their ids.
    fn windows_for_timestamp(&self, state: &mut SchedState, ts: i64) -> Vec<u64> {
        let config = &self.shared.config;
        match config.window_type {
            WindowType::Tumbling => {
                let len = config.window_len_us;
                let id = ts.div_euclid(len);
                let start = id * len;
                let id = id as u64;
                self.materialize(state, id, TimeRange::new(start, start + len));
                vec![id]
            }
            WindowType::Sliding => {
                // Every slide step whose window still covers ts.
                let len = config.window_len_us;
                let slide = config.slide_len_us;
                let mut ids = Vec::new();
                let mut start = ts.div_euclid(slide) * slide;
                while start + len > ts {
                    let id = start.div_euclid(slide) as u64;
                    self.materialize(state, id, TimeRange::new(start, start + len));
                    ids.push(id);
                    start -= slide;
                }
                ids
            }
            WindowType::Session => {
                // Merge into an open session whose gap has not elapsed,
                // extending its end; otherwise open a fresh session.
                let len = config.window_len_us;
                let existing = state
                    .windows
                    .values()
                    .find(|w| w.is_open() && w.range.start_us <= ts && ts < w.range.end_us)
                    .map(|w| w.id);
                match existing {
                    Some(id) => {
                        if let Some(window) = state.windows.get_mut(&id) {
                            window.range.end_us = window.range.end_us.max(ts + len);
                        }
                        vec![id]
                    }
                    None => {
                        let id = state.next_session_id;
                        state.next_session_id += 1;
                        self.materialize(state, id, TimeRange::new(ts, ts + len));
                        vec![id]
                    }
                }
            }
        }
    }

    fn materialize(&self, state: &mut SchedState, id: u64, range: TimeRange) {
        if !state.windows.contains_key(&id) {
            state.windows.insert(id, Window::new(id, range));
            state.counters.windows_created += 1;
            debug!(id, %range, "window created");
        }
    }

    /// Re-evaluates one window's trigger predicate, marking it Ready when
    /// satisfied.  Returns whether the window became ready.
    fn evaluate_trigger(config: &SchedulerConfig, state: &mut SchedState, id: u64) -> bool {
        let Some(window) = state.windows.get(&id) else {
            return false;
        };
        if !window.is_open() {
            return false;
        }

        let time_ready =
            state.watermark >= window.range.end_us.saturating_add(config.watermark_slack_us);
        let count_ready = window.s_count + window.r_count >= config.trigger_count_threshold;

        let satisfied = match config.trigger {
            TriggerPolicy::TimeBased => time_ready,
            TriggerPolicy::CountBased => count_ready,
            TriggerPolicy::Hybrid => time_ready || count_ready,
            TriggerPolicy::Manual => false,
        };

        if satisfied {
            Self::mark_ready(state, id);
        }
        satisfied
    }

    fn mark_ready(state: &mut SchedState, id: u64) {
        if let Some(window) = state.windows.get_mut(&id) {
            if window.is_open() {
                window.state = WindowState::Ready;
                state.ready.push(Reverse(id));
                state.counters.windows_triggered += 1;
                debug!(id, "window ready");
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Dispatch loop
    // --------------------------------------------------------------------------------------------

    fn worker_loop(shared: Arc<SchedShared>) {
        let interval = Duration::from_micros(shared.config.trigger_interval_us);
        loop {
            let to_launch = {
                let Ok(state) = shared.state.lock() else {
                    break;
                };
                let Ok((mut state, _)) = shared.cvar.wait_timeout(state, interval) else {
                    break;
                };
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                Self::collect_launches(&shared, &mut state)
            };

            for (id, range) in to_launch {
                Self::execute_window_async(&shared, id, range);
            }

            Self::cleanup_completed(&shared);
        }
        debug!("scheduler worker stopped");
    }

    /// Pops ready windows up to the concurrency bound, marking each
    /// Executing.  Returns the launches to perform outside the lock.
    fn collect_launches(shared: &SchedShared, state: &mut SchedState) -> Vec<(u64, TimeRange)> {
        let capacity = shared
            .config
            .max_concurrent_windows
            .saturating_sub(state.executing.len());
        let mut launches = Vec::new();
        while launches.len() < capacity {
            let Some(Reverse(id)) = state.ready.pop() else {
                break;
            };
            let Some(window) = state.windows.get_mut(&id) else {
                continue;
            };
            if window.state != WindowState::Ready {
                continue;
            }
            window.state = WindowState::Executing;
            window.submitted_at = Some(Instant::now());
            state.executing.insert(id);
            launches.push((id, window.range));
        }
        launches
    }

    /// Marks the window Executing (already done by the caller), submits
    /// the execution task onto the engine's resource handle, and wires
    /// completion bookkeeping.
    fn execute_window_async(shared: &Arc<SchedShared>, id: u64, range: TimeRange) {
        let task_shared = Arc::clone(shared);
        let task = move || Self::run_window(&task_shared, id, range);

        if !shared.engine.spawn(task) {
            warn!(id, "task submission rejected; executing inline");
            Self::run_window(shared, id, range);
        }
    }

    fn run_window(shared: &Arc<SchedShared>, id: u64, range: TimeRange) {
        let status = match shared.engine.execute_window_join(id, range) {
            Ok(status) => status,
            Err(e) => {
                shared.engine.record_failure();
                ComputeStatus::failure(id, e.to_string())
            }
        };

        let snapshot = {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            state.executing.remove(&id);
            let snapshot = state.windows.get_mut(&id).map(|window| {
                window.state = if status.success {
                    WindowState::Completed
                } else {
                    WindowState::Failed
                };
                window.completed_at = Some(Instant::now());
                window.snapshot()
            });
            if status.success {
                state.counters.windows_completed += 1;
            } else {
                state.counters.windows_failed += 1;
            }
            snapshot
        };
        shared.cvar.notify_all();

        let Some(snapshot) = snapshot else {
            return;
        };

        let Ok(callbacks) = shared.callbacks.lock() else {
            return;
        };
        let list = if status.success {
            &callbacks.completed
        } else {
            &callbacks.failed
        };
        for callback in list {
            if catch_unwind(AssertUnwindSafe(|| callback(&snapshot, &status))).is_err() {
                shared.callback_errors.fetch_add(1, Ordering::Relaxed);
                warn!(id, "window callback panicked");
            }
        }
    }

    /// Removes terminal windows older than the retention threshold.
    fn cleanup_completed(shared: &SchedShared) {
        let Ok(mut state) = shared.state.lock() else {
            return;
        };
        let retention = shared.config.retention;
        let before = state.windows.len();
        state.windows.retain(|_, window| {
            let expired = matches!(window.state, WindowState::Completed | WindowState::Failed)
                && window
                    .completed_at
                    .map(|at| at.elapsed() > retention)
                    .unwrap_or(false);
            !expired
        });
        let removed = (before - state.windows.len()) as u64;
        if removed > 0 {
            state.counters.windows_cleaned_up += removed;
            debug!(removed, "completed windows cleaned up");
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, SchedState>, SchedulerError> {
        self.shared
            .state
            .lock()
            .map_err(|_| SchedulerError::Internal("state lock poisoned".into()))
    }
}

impl IngestObserver for WindowScheduler {
    fn on_data_inserted(&self, table_name: &str, timestamp: i64, count: usize) {
        self.handle_insert(table_name, timestamp, count);
    }
}

impl Drop for WindowScheduler {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false);
        if running {
            let _ = self.stop(false);
        }
    }
}

impl std::fmt::Debug for WindowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowScheduler")
            .field("windows", &self.lock_state().map(|s| s.windows.len()).unwrap_or(0))
            .field("executing", &self.active_window_count())
            .finish()
    }
}
