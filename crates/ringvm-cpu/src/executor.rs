//! Host stream executors.
//!
//! Both executors run packages through a [`KernelRegistry`] and encode
//! completion as a [`CompletionStatus`] header in the package status buffer.
//! [`InlineExecutor`] finishes a package inside `launch`. [`ThreadedExecutor`]
//! hands it to a worker thread and reports completion asynchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use ringvm_core::error::{Result, VmError};
use ringvm_core::kernel::KernelRegistry;
use ringvm_core::memory::DeviceContext;
use ringvm_core::package::{CompletionStatus, StatusBuffer};
use ringvm_core::stream::{PackageFailure, PackageLaunch, StreamExecutor};

/// Error code written to the status header of a failed package.
pub const ERROR_CODE_KERNEL_FAILED: u32 = 1;

/// Snapshot of executor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Packages accepted by `launch`.
    pub packages_launched: u64,
    /// Packages that ran to completion.
    pub packages_succeeded: u64,
    /// Packages with at least one failed chain.
    pub packages_failed: u64,
    /// Chains stopped by a kernel error.
    pub chains_failed: u64,
    /// Instructions executed.
    pub instructions_executed: u64,
}

#[derive(Debug, Default)]
struct ExecutorCounters {
    packages_launched: AtomicU64,
    packages_succeeded: AtomicU64,
    packages_failed: AtomicU64,
    chains_failed: AtomicU64,
    instructions_executed: AtomicU64,
}

impl ExecutorCounters {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            packages_launched: self.packages_launched.load(Ordering::Relaxed),
            packages_succeeded: self.packages_succeeded.load(Ordering::Relaxed),
            packages_failed: self.packages_failed.load(Ordering::Relaxed),
            chains_failed: self.chains_failed.load(Ordering::Relaxed),
            instructions_executed: self.instructions_executed.load(Ordering::Relaxed),
        }
    }
}

/// Run every chain of a package in order.
///
/// Chains batched into one package are independent of each other, so a
/// failing instruction stops only the rest of its own chain.
fn run_package(
    registry: &KernelRegistry,
    device: &dyn DeviceContext,
    launch: &PackageLaunch,
    counters: &ExecutorCounters,
) -> Option<PackageFailure> {
    let mut failed = Vec::new();
    for chain in &launch.chains {
        for task in &chain.instructions {
            if let Err(e) = registry.run(task, device, launch.stream) {
                error!(
                    package = %launch.package,
                    chain = %chain.chain,
                    opcode = task.opcode(),
                    error = %e,
                    "instruction failed"
                );
                failed.push((chain.chain, e));
                break;
            }
            counters.instructions_executed.fetch_add(1, Ordering::Relaxed);
        }
    }
    if failed.is_empty() {
        counters.packages_succeeded.fetch_add(1, Ordering::Relaxed);
        return None;
    }
    counters.packages_failed.fetch_add(1, Ordering::Relaxed);
    counters
        .chains_failed
        .fetch_add(failed.len() as u64, Ordering::Relaxed);
    Some(PackageFailure { chains: failed })
}

fn finished_status(ticket: u64, chains_total: u32, failure: Option<&PackageFailure>) -> CompletionStatus {
    let chains_failed = failure.map_or(0, |f| f.chains.len() as u32);
    CompletionStatus {
        ticket,
        state: if chains_failed > 0 {
            CompletionStatus::STATE_FAILED
        } else {
            CompletionStatus::STATE_DONE
        },
        error_code: if chains_failed > 0 { ERROR_CODE_KERNEL_FAILED } else { 0 },
        chains_total,
        chains_completed: chains_total - chains_failed,
        chains_failed,
        reserved: 0,
    }
}

/// Executor that runs each package synchronously inside `launch`.
pub struct InlineExecutor {
    name: String,
    registry: Arc<KernelRegistry>,
    device: Arc<dyn DeviceContext>,
    next_ticket: AtomicU64,
    failures: Mutex<HashMap<u64, PackageFailure>>,
    counters: ExecutorCounters,
}

impl InlineExecutor {
    /// Create an inline executor on `device`.
    pub fn new(registry: Arc<KernelRegistry>, device: Arc<dyn DeviceContext>) -> Self {
        let name = format!("inline-{}:{}", device.device_type(), device.device_id());
        Self {
            name,
            registry,
            device,
            next_ticket: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            counters: ExecutorCounters::default(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }
}

impl StreamExecutor for InlineExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, launch: PackageLaunch, status: &mut StatusBuffer) -> Result<()> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.packages_launched.fetch_add(1, Ordering::Relaxed);
        let chains_total = launch.chains.len() as u32;

        let failure = run_package(&self.registry, self.device.as_ref(), &launch, &self.counters);
        status.write(&finished_status(ticket, chains_total, failure.as_ref()));
        if let Some(failure) = failure {
            self.failures.lock().insert(ticket, failure);
        }
        trace!(executor = %self.name, package = %launch.package, ticket, "package ran inline");
        Ok(())
    }

    fn query_done(&self, status: &StatusBuffer) -> bool {
        status.read::<CompletionStatus>().is_finished()
    }

    fn take_failure(&self, status: &StatusBuffer) -> Option<PackageFailure> {
        let header = status.read::<CompletionStatus>();
        if header.state != CompletionStatus::STATE_FAILED {
            return None;
        }
        self.failures.lock().remove(&header.ticket)
    }
}

impl std::fmt::Debug for InlineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineExecutor")
            .field("name", &self.name)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

struct Job {
    ticket: u64,
    launch: PackageLaunch,
}

/// Executor backed by a dedicated worker thread.
///
/// Packages run in launch order. Completion is published in a shared map
/// keyed by ticket and consumed by `take_failure`.
pub struct ThreadedExecutor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_ticket: AtomicU64,
    completed: Arc<Mutex<HashMap<u64, Option<PackageFailure>>>>,
    counters: Arc<ExecutorCounters>,
}

impl ThreadedExecutor {
    /// Spawn the worker thread.
    pub fn spawn(registry: Arc<KernelRegistry>, device: Arc<dyn DeviceContext>) -> Result<Self> {
        let name = format!("threaded-{}:{}", device.device_type(), device.device_id());
        let (sender, receiver) = channel::unbounded::<Job>();
        let completed: Arc<Mutex<HashMap<u64, Option<PackageFailure>>>> = Arc::default();
        let counters = Arc::new(ExecutorCounters::default());

        let worker = {
            let completed = Arc::clone(&completed);
            let counters = Arc::clone(&counters);
            let thread_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    debug!(executor = %thread_name, "worker started");
                    for job in receiver.iter() {
                        let failure =
                            run_package(&registry, device.as_ref(), &job.launch, &counters);
                        trace!(executor = %thread_name, package = %job.launch.package, ticket = job.ticket, "package ran");
                        completed.lock().insert(job.ticket, failure);
                    }
                    debug!(executor = %thread_name, "worker stopped");
                })
                .map_err(|e| VmError::ExecutorError(format!("failed to spawn {}: {}", name, e)))?
        };

        info!(executor = %name, "threaded executor started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            next_ticket: AtomicU64::new(0),
            completed,
            counters,
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Whether the worker still accepts packages.
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting packages and join the worker after it drains its queue.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(executor = %self.name, "worker panicked");
            }
        }
        info!(executor = %self.name, "threaded executor stopped");
    }
}

impl StreamExecutor for ThreadedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, launch: PackageLaunch, status: &mut StatusBuffer) -> Result<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(VmError::ShuttingDown)?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        status.write(&CompletionStatus {
            ticket,
            state: CompletionStatus::STATE_LAUNCHED,
            chains_total: launch.chains.len() as u32,
            ..Default::default()
        });
        sender
            .send(Job { ticket, launch })
            .map_err(|_| VmError::ExecutorError(format!("{} worker is gone", self.name)))?;
        self.counters.packages_launched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn query_done(&self, status: &StatusBuffer) -> bool {
        let ticket = status.read::<CompletionStatus>().ticket;
        self.completed.lock().contains_key(&ticket)
    }

    fn take_failure(&self, status: &StatusBuffer) -> Option<PackageFailure> {
        let ticket = status.read::<CompletionStatus>().ticket;
        self.completed.lock().remove(&ticket).flatten()
    }
}

impl Drop for ThreadedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedExecutor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
