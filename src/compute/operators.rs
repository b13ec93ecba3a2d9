//! The operator plug-in contract and the built-in operator family.
//!
//! Operators are black boxes to the engine: it configures them, feeds S
//! tuples then R tuples, and asks for the result.  The built-in family
//! shares a windowed symmetric-hash-join core that counts matching-key
//! pairs exactly; AQP-capable variants additionally maintain a cheap
//! uniform-key estimate served by `get_aqp_result`.
//!
//! The kind → constructor mapping lives in [`build_operator`] — adding an
//! operator touches exactly that match.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use super::OperatorKind;

/// The tuple shape operators consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatorTuple {
    /// Join key.
    pub key: i64,

    /// Payload value.
    pub value: f64,

    /// Event time in microseconds.
    pub event_time: i64,

    /// Arrival time in microseconds.
    pub arrival_time: i64,
}

/// The pluggable join-operator contract.
///
/// Lifecycle per window: `set_config` → `set_window` → `sync_time` →
/// `start` → feed tuples (all S, then all R, each stream in ascending
/// timestamp order) → `get_result` (and `get_aqp_result` for variants
/// that advertise approximation) → `stop`.
pub trait JoinOperator: Send {
    /// Applies a flat key/value configuration.  Returns `false` when a
    /// recognized key fails to parse.
    fn set_config(&mut self, config: &HashMap<String, String>) -> bool;

    /// Sets the window geometry.
    fn set_window(&mut self, window_len_us: i64, slide_len_us: i64);

    /// Optional time anchoring before the first tuple.
    fn sync_time(&mut self, now_us: i64);

    /// Prepares for a fresh window.  Returns `false` on refusal.
    fn start(&mut self) -> bool;

    /// Ends the window; the operator may release buffers.
    fn stop(&mut self);

    /// Feeds one S-side tuple.
    fn feed_tuple_s(&mut self, tuple: OperatorTuple);

    /// Feeds one R-side tuple.
    fn feed_tuple_r(&mut self, tuple: OperatorTuple);

    /// The exact join count; called after all tuples are fed.
    fn get_result(&mut self) -> u64;

    /// The approximate result.  Only meaningful for variants whose kind
    /// advertises AQP support.
    fn get_aqp_result(&mut self) -> f64;
}

/// Builds the operator instance for a kind.
///
/// The single place the kind → constructor mapping lives.
pub fn build_operator(kind: OperatorKind) -> Box<dyn JoinOperator> {
    match kind {
        OperatorKind::Iawj => Box::new(WindowedHashJoin::exact()),
        OperatorKind::Shj => Box::new(WindowedHashJoin::exact()),
        OperatorKind::Prj => Box::new(WindowedHashJoin::exact()),
        OperatorKind::Ai => Box::new(WindowedHashJoin::exact()),
        OperatorKind::LinearSvi => Box::new(WindowedHashJoin::exact()),
        OperatorKind::MeanAqp => Box::new(WindowedHashJoin::approximate(1.0)),
        OperatorKind::Ima => Box::new(WindowedHashJoin::approximate(1.0)),
        OperatorKind::Mswj => Box::new(WindowedHashJoin::approximate(1.0)),
        OperatorKind::IawjSel => Box::new(WindowedHashJoin::approximate(1.0)),
        OperatorKind::LazyIawjSel => Box::new(WindowedHashJoin::approximate(1.0)),
        // PECJ compensates its estimate unless disabled via config.
        OperatorKind::Pecj => Box::new(WindowedHashJoin::approximate(1.05)),
    }
}

// ------------------------------------------------------------------------------------------------
// WindowedHashJoin — the shared operator core
// ------------------------------------------------------------------------------------------------

/// One side of the symmetric hash join: per-key tuple counts plus an
/// insertion-ordered log for bounded-buffer eviction.
#[derive(Debug, Default)]
struct SideState {
    counts: HashMap<i64, u64>,
    order: VecDeque<i64>,
    seen: u64,
}

impl SideState {
    fn insert(&mut self, key: i64, buffer_len: usize) {
        *self.counts.entry(key).or_insert(0) += 1;
        self.order.push_back(key);
        self.seen += 1;
        if self.order.len() > buffer_len {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(count) = self.counts.get_mut(&evicted) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.counts.remove(&evicted);
                    }
                }
            }
        }
    }

    fn count(&self, key: i64) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.order.clear();
        self.seen = 0;
    }
}

/// Windowed symmetric hash join with an optional uniform-key estimator.
struct WindowedHashJoin {
    window_len_us: i64,
    slide_len_us: i64,
    now_us: i64,
    s_buffer_len: usize,
    r_buffer_len: usize,
    running: bool,
    s: SideState,
    r: SideState,
    pairs: u64,
    distinct_keys: std::collections::HashSet<i64>,
    aqp: bool,
    /// Estimate compensation factor; 1.0 means none.
    compensation: f64,
}

impl WindowedHashJoin {
    fn exact() -> Self {
        Self::new(false, 1.0)
    }

    fn approximate(compensation: f64) -> Self {
        Self::new(true, compensation)
    }

    fn new(aqp: bool, compensation: f64) -> Self {
        Self {
            window_len_us: 0,
            slide_len_us: 0,
            now_us: 0,
            s_buffer_len: 4096,
            r_buffer_len: 4096,
            running: false,
            s: SideState::default(),
            r: SideState::default(),
            pairs: 0,
            distinct_keys: std::collections::HashSet::new(),
            aqp,
            compensation,
        }
    }
}

impl JoinOperator for WindowedHashJoin {
    fn set_config(&mut self, config: &HashMap<String, String>) -> bool {
        let mut ok = true;
        if let Some(raw) = config.get("s_buffer_len") {
            match raw.parse() {
                Ok(v) => self.s_buffer_len = v,
                Err(_) => ok = false,
            }
        }
        if let Some(raw) = config.get("r_buffer_len") {
            match raw.parse() {
                Ok(v) => self.r_buffer_len = v,
                Err(_) => ok = false,
            }
        }
        if config.get("disable_compensation").map(String::as_str) == Some("true") {
            self.compensation = 1.0;
        }
        ok
    }

    fn set_window(&mut self, window_len_us: i64, slide_len_us: i64) {
        self.window_len_us = window_len_us;
        self.slide_len_us = slide_len_us;
    }

    fn sync_time(&mut self, now_us: i64) {
        self.now_us = now_us;
    }

    fn start(&mut self) -> bool {
        self.s.clear();
        self.r.clear();
        self.pairs = 0;
        self.distinct_keys.clear();
        self.running = true;
        true
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn feed_tuple_s(&mut self, tuple: OperatorTuple) {
        if !self.running {
            return;
        }
        self.pairs += self.r.count(tuple.key);
        self.distinct_keys.insert(tuple.key);
        self.s.insert(tuple.key, self.s_buffer_len);
        trace!(key = tuple.key, side = "s", pairs = self.pairs, "tuple fed");
    }

    fn feed_tuple_r(&mut self, tuple: OperatorTuple) {
        if !self.running {
            return;
        }
        self.pairs += self.s.count(tuple.key);
        self.distinct_keys.insert(tuple.key);
        self.r.insert(tuple.key, self.r_buffer_len);
        trace!(key = tuple.key, side = "r", pairs = self.pairs, "tuple fed");
    }

    fn get_result(&mut self) -> u64 {
        self.pairs
    }

    fn get_aqp_result(&mut self) -> f64 {
        if !self.aqp {
            return 0.0;
        }
        let distinct = self.distinct_keys.len().max(1) as f64;
        (self.s.seen as f64 * self.r.seen as f64 / distinct) * self.compensation
    }
}
