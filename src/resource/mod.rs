//! # Resource Manager
//!
//! A process-wide budget of worker threads and memory, carved into
//! handles.  A handle entitles one named caller — an operator plug-in or
//! a compute engine — to submit fire-and-forget tasks onto its own FIFO
//! queue, serviced by worker threads drawn from the global pool.
//!
//! ## Allocation
//!
//! [`ResourceManager::allocate`] clamps each request to whatever remains
//! of the global budget, summed over both partitions (plugins and compute
//! engines).  When no thread or no minimum memory remains, allocation
//! returns `None`.  Memory can be adjusted at runtime; changing the
//! thread count requires releasing and re-allocating.
//!
//! ## Scheduling model
//!
//! Parallel worker threads per handle; tasks are FIFO within a handle; no
//! cross-handle ordering.  A task is a closure producing no result —
//! panics inside a task are caught, counted as errors, and never poison
//! the worker.
//!
//! ## Cancellation
//!
//! Releasing a handle (or dropping it) invalidates it and signals its
//! workers to stop polling; a task already running completes.  There is
//! no forced cancellation of in-flight work.


use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, trace, warn};

/// Minimum memory grant; a clamped allocation below this fails.
pub const MIN_ALLOC_MEMORY_BYTES: u64 = 1024 * 1024;

/// Utilization at or above which [`ResourceManager::is_under_pressure`]
/// reports `true` for a dimension.
const PRESSURE_RATIO: f64 = 0.9;

/// Base delay unit applied between task dispatches when a handle is
/// throttled.
const THROTTLE_BASE: Duration = Duration::from_millis(1);

type Task = Box<dyn FnOnce() + Send + 'static>;

// ------------------------------------------------------------------------------------------------
// Requests and usage
// ------------------------------------------------------------------------------------------------

/// What a caller asks for — and, after clamping, what it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Worker threads.
    pub threads: usize,

    /// Memory budget in bytes.
    pub memory_bytes: u64,
}

/// Caller-reported usage of one handle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Threads the holder currently keeps busy.
    pub threads_used: usize,

    /// Memory the holder currently uses, in bytes.
    pub memory_used_bytes: u64,

    /// Depth of the holder's task queue.
    pub queue_length: usize,

    /// Tuples processed so far.
    pub tuples_processed: u64,

    /// Errors observed so far (includes caught task panics).
    pub errors_count: u64,

    /// Average task latency in milliseconds.
    pub avg_latency_ms: f64,
}

/// Which registry partition a handle lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Plugin,
    Compute,
}

// ------------------------------------------------------------------------------------------------
// Handle internals
// ------------------------------------------------------------------------------------------------

struct HandleShared {
    name: String,
    partition: Partition,
    allocated: Mutex<ResourceRequest>,
    valid: AtomicBool,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    usage: Mutex<ResourceUsage>,
    errors: AtomicU64,
    /// Submission slow-down factor; 1.0 means no throttling.
    throttle: Mutex<f64>,
}

impl HandleShared {
    fn allocated(&self) -> ResourceRequest {
        self.allocated
            .lock()
            .map(|g| *g)
            .unwrap_or(ResourceRequest {
                threads: 0,
                memory_bytes: 0,
            })
    }

    /// Signals workers to stop polling and joins them.  Tasks already
    /// running complete; queued tasks are dropped with the channel.
    fn shut_down(&self) {
        self.valid.store(false, Ordering::Release);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<HandleShared>, receiver: Receiver<Task>) {
    loop {
        if !shared.valid.load(Ordering::Acquire) {
            break;
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => {
                let throttle = shared.throttle.lock().map(|g| *g).unwrap_or(1.0);

                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    shared.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(handle = %shared.name, "task panicked; counted as error");
                }

                // A recorded throttle intent slows dispatch by inserting a
                // delay proportional to the factor between tasks.
                if throttle > 1.0 {
                    thread::sleep(THROTTLE_BASE.mul_f64(throttle - 1.0));
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!(handle = %shared.name, "worker stopped");
}

// ------------------------------------------------------------------------------------------------
// ResourceHandle
// ------------------------------------------------------------------------------------------------

/// A quota and task-queue endpoint granted to one named caller.
///
/// The handle is exclusive to its holder.  Dropping it releases the
/// underlying allocation: workers wind down and the registry entry is
/// cleared.
pub struct ResourceHandle {
    shared: Arc<HandleShared>,
    manager: Weak<ManagerInner>,
}

impl ResourceHandle {
    /// Name this handle was allocated under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of the effective (clamped) allocation.
    pub fn allocated(&self) -> ResourceRequest {
        self.shared.allocated()
    }

    /// Whether the handle still accepts tasks.
    pub fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::Acquire)
    }

    /// Submits a task onto the handle's FIFO queue.
    ///
    /// Returns `false` iff the handle has been invalidated.
    pub fn submit_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if !self.is_valid() {
            return false;
        }
        let Ok(sender) = self.shared.sender.lock() else {
            return false;
        };
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Caller-driven metrics update.
    ///
    /// Task-panic errors counted by the workers are merged on top of the
    /// reported `errors_count`.
    pub fn report_usage(&self, usage: ResourceUsage) {
        if let Ok(mut slot) = self.shared.usage.lock() {
            *slot = usage;
            slot.errors_count += self.shared.errors.load(Ordering::Relaxed);
        }
    }

    /// Current depth of the task queue.
    pub fn queue_length(&self) -> usize {
        self.shared
            .sender
            .lock()
            .ok()
            .and_then(|sender| sender.as_ref().map(Sender::len))
            .unwrap_or(0)
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release_entry(&self.shared.name, self.shared.partition);
        } else {
            self.shared.shut_down();
        }
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("name", &self.shared.name)
            .field("allocated", &self.shared.allocated())
            .field("valid", &self.is_valid())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// ResourceManager
// ------------------------------------------------------------------------------------------------

struct Registry {
    plugins: HashMap<String, Arc<HandleShared>>,
    compute: HashMap<String, Arc<HandleShared>>,
}

impl Registry {
    fn partition(&self, partition: Partition) -> &HashMap<String, Arc<HandleShared>> {
        match partition {
            Partition::Plugin => &self.plugins,
            Partition::Compute => &self.compute,
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut HashMap<String, Arc<HandleShared>> {
        match partition {
            Partition::Plugin => &mut self.plugins,
            Partition::Compute => &mut self.compute,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<HandleShared>> {
        self.plugins.values().chain(self.compute.values())
    }

    fn allocated_threads(&self) -> usize {
        self.all().map(|h| h.allocated().threads).sum()
    }

    fn allocated_memory(&self) -> u64 {
        self.all().map(|h| h.allocated().memory_bytes).sum()
    }
}

struct ManagerInner {
    max_threads: usize,
    max_memory_bytes: u64,
    registry: Mutex<Registry>,
}

impl ManagerInner {
    fn release_entry(&self, name: &str, partition: Partition) {
        let removed = match self.registry.lock() {
            Ok(mut registry) => registry.partition_mut(partition).remove(name),
            Err(_) => None,
        };
        if let Some(shared) = removed {
            shared.shut_down();
            debug!(name, "resource handle released");
        }
    }
}

/// The process-wide thread and memory budget.
///
/// Created once per process by the application entry point and passed
/// explicitly; tests use fresh instances per case.
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    /// Creates a manager with the given global caps.
    pub fn new(max_threads: usize, max_memory_bytes: u64) -> Self {
        info!(max_threads, max_memory_bytes, "resource manager ready");
        Self {
            inner: Arc::new(ManagerInner {
                max_threads,
                max_memory_bytes,
                registry: Mutex::new(Registry {
                    plugins: HashMap::new(),
                    compute: HashMap::new(),
                }),
            }),
        }
    }

    /// Global thread cap.
    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    /// Global memory cap in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.inner.max_memory_bytes
    }

    /// Allocates a handle for an operator plug-in.
    ///
    /// The effective allocation is the request clamped to the remaining
    /// global budget.  Returns `None` when no thread is available, when
    /// less than [`MIN_ALLOC_MEMORY_BYTES`] remains, or when the name is
    /// already registered.
    pub fn allocate(&self, name: &str, request: ResourceRequest) -> Option<ResourceHandle> {
        self.allocate_in(name, request, Partition::Plugin)
    }

    /// Allocates a handle for a compute engine.  Same contract as
    /// [`ResourceManager::allocate`], in the compute partition.
    pub fn allocate_for_compute(
        &self,
        name: &str,
        request: ResourceRequest,
    ) -> Option<ResourceHandle> {
        self.allocate_in(name, request, Partition::Compute)
    }

    /// Releases a plug-in handle by name, invalidating it and draining
    /// its workers.
    pub fn release(&self, name: &str) {
        self.inner.release_entry(name, Partition::Plugin);
    }

    /// Releases a compute-engine handle by name.
    pub fn release_compute(&self, name: &str) {
        self.inner.release_entry(name, Partition::Compute);
    }

    /// Last usage reported for a named handle, in either partition.
    pub fn query_usage(&self, name: &str) -> Option<ResourceUsage> {
        let registry = self.inner.registry.lock().ok()?;
        let shared = registry
            .partition(Partition::Plugin)
            .get(name)
            .or_else(|| registry.partition(Partition::Compute).get(name))?;
        shared.usage.lock().ok().map(|usage| *usage)
    }

    /// Sum of reported usage across all live handles.
    pub fn total_usage(&self) -> ResourceUsage {
        let Ok(registry) = self.inner.registry.lock() else {
            return ResourceUsage::default();
        };
        let mut total = ResourceUsage::default();
        let mut handles = 0usize;
        let mut latency_sum = 0.0f64;
        for shared in registry.all() {
            if let Ok(usage) = shared.usage.lock() {
                total.threads_used += usage.threads_used;
                total.memory_used_bytes += usage.memory_used_bytes;
                total.queue_length += usage.queue_length;
                total.tuples_processed += usage.tuples_processed;
                total.errors_count += usage.errors_count;
                latency_sum += usage.avg_latency_ms;
                handles += 1;
            }
        }
        if handles > 0 {
            total.avg_latency_ms = latency_sum / handles as f64;
        }
        total
    }

    /// Whether any dimension's **allocation** has reached 90% of its cap.
    pub fn is_under_pressure(&self) -> bool {
        let Ok(registry) = self.inner.registry.lock() else {
            return false;
        };
        let threads = registry.allocated_threads() as f64;
        let memory = registry.allocated_memory() as f64;
        threads >= self.inner.max_threads as f64 * PRESSURE_RATIO
            || memory >= self.inner.max_memory_bytes as f64 * PRESSURE_RATIO
    }

    /// Records the intent that the named compute engine slow task
    /// submission by `factor` (>= 1.0).  Workers model it by inserting
    /// delays between dispatches.
    pub fn throttle_compute(&self, name: &str, factor: f64) -> bool {
        let Ok(registry) = self.inner.registry.lock() else {
            return false;
        };
        let Some(shared) = registry.partition(Partition::Compute).get(name) else {
            return false;
        };
        if let Ok(mut throttle) = shared.throttle.lock() {
            *throttle = factor.max(1.0);
            debug!(name, factor, "compute throttle recorded");
            return true;
        }
        false
    }

    /// Adjusts the memory grant of a named handle at runtime.
    ///
    /// Only memory supports runtime adjustment; changing the thread count
    /// requires releasing and re-allocating the handle.  Fails when the
    /// new grant would not fit the remaining global budget.
    pub fn adjust_memory(&self, name: &str, new_memory_bytes: u64) -> bool {
        let Ok(registry) = self.inner.registry.lock() else {
            return false;
        };
        let Some(shared) = registry
            .partition(Partition::Plugin)
            .get(name)
            .or_else(|| registry.partition(Partition::Compute).get(name))
        else {
            return false;
        };

        let current = shared.allocated().memory_bytes;
        let others = registry.allocated_memory() - current;
        if others + new_memory_bytes > self.inner.max_memory_bytes {
            return false;
        }
        if let Ok(mut allocated) = shared.allocated.lock() {
            allocated.memory_bytes = new_memory_bytes;
            return true;
        }
        false
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn allocate_in(
        &self,
        name: &str,
        request: ResourceRequest,
        partition: Partition,
    ) -> Option<ResourceHandle> {
        let Ok(mut registry) = self.inner.registry.lock() else {
            return None;
        };

        if registry.partition(partition).contains_key(name) {
            warn!(name, "allocation refused: name already registered");
            return None;
        }

        let remaining_threads = self
            .inner
            .max_threads
            .saturating_sub(registry.allocated_threads());
        let remaining_memory = self
            .inner
            .max_memory_bytes
            .saturating_sub(registry.allocated_memory());

        let effective = ResourceRequest {
            threads: request.threads.min(remaining_threads),
            memory_bytes: request.memory_bytes.min(remaining_memory),
        };

        if effective.threads == 0 || effective.memory_bytes < MIN_ALLOC_MEMORY_BYTES {
            debug!(
                name,
                requested_threads = request.threads,
                remaining_threads,
                remaining_memory,
                "allocation refused: budget exhausted"
            );
            return None;
        }

        let (sender, receiver) = unbounded::<Task>();
        let shared = Arc::new(HandleShared {
            name: name.to_string(),
            partition,
            allocated: Mutex::new(effective),
            valid: AtomicBool::new(true),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(effective.threads)),
            usage: Mutex::new(ResourceUsage::default()),
            errors: AtomicU64::new(0),
            throttle: Mutex::new(1.0),
        });

        let mut spawned = Vec::with_capacity(effective.threads);
        for i in 0..effective.threads {
            let worker_shared = Arc::clone(&shared);
            let worker_receiver = receiver.clone();
            match thread::Builder::new()
                .name(format!("rsrc-{name}-{i}"))
                .spawn(move || worker_loop(worker_shared, worker_receiver))
            {
                Ok(handle) => spawned.push(handle),
                Err(e) => {
                    warn!(name, error = %e, "worker spawn failed; rolling back allocation");
                    if let Ok(mut workers) = shared.workers.lock() {
                        workers.append(&mut spawned);
                    }
                    shared.shut_down();
                    return None;
                }
            }
        }
        if let Ok(mut workers) = shared.workers.lock() {
            workers.append(&mut spawned);
        }

        registry
            .partition_mut(partition)
            .insert(name.to_string(), Arc::clone(&shared));

        info!(
            name,
            threads = effective.threads,
            memory_bytes = effective.memory_bytes,
            ?partition,
            "resource handle allocated"
        );

        Some(ResourceHandle {
            shared,
            manager: Arc::downgrade(&self.inner),
        })
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("max_threads", &self.inner.max_threads)
            .field("max_memory_bytes", &self.inner.max_memory_bytes)
            .finish()
    }
}
