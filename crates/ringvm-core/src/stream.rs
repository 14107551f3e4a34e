//! Streams and the executor interface.
//!
//! A [`Stream`] owns the packages launched on one execution queue. Packages
//! wait in `waiting` until an in-flight slot is free, then move to `active`
//! until the executor reports them done through the status buffer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::chain::InstrChain;
use crate::error::{Result, VmError};
use crate::kernel::InstructionTask;
use crate::package::{ChainPackage, StatusBuffer};
use crate::stream_role::StreamDesc;
use crate::types::{ChainId, PackageId, StreamId};

/// Owned instructions of one chain.
#[derive(Debug, Clone)]
pub struct ChainTask {
    /// Source chain.
    pub chain: ChainId,
    /// Instructions in admission order.
    pub instructions: Vec<InstructionTask>,
}

impl ChainTask {
    /// Snapshot a chain.
    pub fn from_chain(chain: &InstrChain) -> Self {
        Self {
            chain: chain.id(),
            instructions: chain
                .instructions()
                .iter()
                .map(InstructionTask::from_instruction)
                .collect(),
        }
    }
}

/// Work handed to an executor for one package.
#[derive(Debug, Clone)]
pub struct PackageLaunch {
    /// Package id.
    pub package: PackageId,
    /// Stream type the package runs on.
    pub stream: StreamDesc,
    /// Chains in execution order.
    pub chains: Vec<ChainTask>,
}

impl PackageLaunch {
    /// Total instructions across all chains.
    pub fn num_instructions(&self) -> usize {
        self.chains.iter().map(|c| c.instructions.len()).sum()
    }
}

/// Executes packages for one stream and reports completion.
///
/// The status buffer encoding is private to the executor. The scheduler only
/// initializes it, passes it to `launch`, and polls it with `query_done`.
pub trait StreamExecutor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str {
        "executor"
    }

    /// Prepare a fresh status buffer.
    fn init_status(&self, status: &mut StatusBuffer) {
        status.clear();
    }

    /// Start executing a package.
    fn launch(&self, launch: PackageLaunch, status: &mut StatusBuffer) -> Result<()>;

    /// Whether the launched package has finished.
    fn query_done(&self, status: &StatusBuffer) -> bool;

    /// Chains of a finished package that did not run to completion.
    ///
    /// Called once after `query_done` returned true. Chains not named in the
    /// failure completed.
    fn take_failure(&self, _status: &StatusBuffer) -> Option<PackageFailure> {
        None
    }
}

/// Chains of one package that did not run to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageFailure {
    /// Failed chains with the error that stopped each.
    pub chains: Vec<(ChainId, VmError)>,
}

impl PackageFailure {
    /// Every chain in `chains` failed with `error`.
    pub fn all(chains: &[ChainId], error: VmError) -> Self {
        Self {
            chains: chains.iter().map(|id| (*id, error.clone())).collect(),
        }
    }

    /// Whether `chain` is among the failed chains.
    pub fn contains(&self, chain: ChainId) -> bool {
        self.chains.iter().any(|(id, _)| *id == chain)
    }

    /// Error of the first failed chain.
    pub fn first_error(&self) -> Option<&VmError> {
        self.chains.first().map(|(_, e)| e)
    }
}

/// A package whose completion has been observed.
#[derive(Debug)]
pub struct CompletedPackage {
    /// The package.
    pub package: ChainPackage,
    /// Chains the executor reported as failed, if any.
    pub failure: Option<PackageFailure>,
}

#[derive(Debug, Default)]
struct StreamCounters {
    packages_launched: AtomicU64,
    packages_completed: AtomicU64,
    packages_failed: AtomicU64,
    chains_launched: AtomicU64,
    instructions_launched: AtomicU64,
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Stream id.
    pub stream: StreamId,
    /// Stream type.
    pub desc: StreamDesc,
    /// Packages handed to the executor.
    pub packages_launched: u64,
    /// Packages whose completion was observed.
    pub packages_completed: u64,
    /// Completed packages that reported an error.
    pub packages_failed: u64,
    /// Chains handed to the executor.
    pub chains_launched: u64,
    /// Instructions handed to the executor.
    pub instructions_launched: u64,
    /// Packages currently launched.
    pub in_flight: usize,
    /// Packages waiting for an in-flight slot.
    pub waiting: usize,
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} launched, {} completed ({} failed), {} in flight",
            self.stream,
            self.desc,
            self.packages_launched,
            self.packages_completed,
            self.packages_failed,
            self.in_flight
        )
    }
}

/// One execution queue of a given stream type.
pub struct Stream {
    id: StreamId,
    desc: StreamDesc,
    index: usize,
    executor: Arc<dyn StreamExecutor>,
    max_in_flight: usize,
    waiting: VecDeque<(ChainPackage, PackageLaunch)>,
    active: VecDeque<ChainPackage>,
    finished: VecDeque<CompletedPackage>,
    counters: StreamCounters,
}

impl Stream {
    /// Create a stream.
    ///
    /// `index` is the position of this stream among streams of the same
    /// type, as addressed by a stream mask.
    pub fn new(
        id: StreamId,
        desc: StreamDesc,
        index: usize,
        executor: Arc<dyn StreamExecutor>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            id,
            desc,
            index,
            executor,
            max_in_flight: max_in_flight.max(1),
            waiting: VecDeque::new(),
            active: VecDeque::new(),
            finished: VecDeque::new(),
            counters: StreamCounters::default(),
        }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream type.
    #[must_use]
    pub fn desc(&self) -> StreamDesc {
        self.desc
    }

    /// Position among streams of the same type.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The executor.
    pub fn executor(&self) -> &Arc<dyn StreamExecutor> {
        &self.executor
    }

    /// Packages launched and not yet observed complete.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Packages waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Whether another package may be queued without exceeding the limit.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.active.len() + self.waiting.len() < self.max_in_flight
    }

    /// Nothing queued, launched, or awaiting collection.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.active.is_empty() && self.finished.is_empty()
    }

    /// Queue a package for launch.
    pub fn enqueue(&mut self, package: ChainPackage, launch: PackageLaunch) {
        debug_assert_eq!(package.stream_id(), self.id);
        self.waiting.push_back((package, launch));
    }

    /// Launch waiting packages while in-flight slots are free.
    ///
    /// Returns the number launched. A package whose launch fails is
    /// reported as a failed completion by the next [`Stream::poll_done`].
    pub fn pump(&mut self) -> usize {
        let mut launched = 0;
        while self.active.len() < self.max_in_flight {
            let Some((mut package, launch)) = self.waiting.pop_front() else {
                break;
            };
            let chains = launch.chains.len() as u64;
            let instructions = launch.num_instructions() as u64;
            self.executor.init_status(package.status_mut());
            match self.executor.launch(launch, package.status_mut()) {
                Ok(()) => {
                    self.counters.packages_launched.fetch_add(1, Ordering::Relaxed);
                    self.counters.chains_launched.fetch_add(chains, Ordering::Relaxed);
                    self.counters
                        .instructions_launched
                        .fetch_add(instructions, Ordering::Relaxed);
                    trace!(
                        stream = %self.id,
                        package = %package.id(),
                        chains,
                        executor = self.executor.name(),
                        "package launched"
                    );
                    self.active.push_back(package);
                    launched += 1;
                }
                Err(e) => {
                    error!(stream = %self.id, package = %package.id(), error = %e, "package launch failed");
                    package.mark_completion_observed();
                    let failure = PackageFailure::all(package.chains(), e);
                    self.finished.push_back(CompletedPackage {
                        package,
                        failure: Some(failure),
                    });
                }
            }
        }
        launched
    }

    /// Collect every package whose completion is newly observed.
    pub fn poll_done(&mut self) -> Vec<CompletedPackage> {
        let mut done: Vec<CompletedPackage> = self.finished.drain(..).collect();
        let mut still_active = VecDeque::with_capacity(self.active.len());
        while let Some(mut package) = self.active.pop_front() {
            if !self.executor.query_done(package.status()) {
                still_active.push_back(package);
                continue;
            }
            if !package.mark_completion_observed() {
                continue;
            }
            let failure = self.executor.take_failure(package.status());
            debug!(
                stream = %self.id,
                package = %package.id(),
                failed_chains = failure.as_ref().map_or(0, |f| f.chains.len()),
                "package done"
            );
            done.push(CompletedPackage { package, failure });
        }
        self.active = still_active;

        for completed in &done {
            self.counters.packages_completed.fetch_add(1, Ordering::Relaxed);
            if completed.failure.is_some() {
                self.counters.packages_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        done
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            stream: self.id,
            desc: self.desc,
            packages_launched: self.counters.packages_launched.load(Ordering::Relaxed),
            packages_completed: self.counters.packages_completed.load(Ordering::Relaxed),
            packages_failed: self.counters.packages_failed.load(Ordering::Relaxed),
            chains_launched: self.counters.chains_launched.load(Ordering::Relaxed),
            instructions_launched: self.counters.instructions_launched.load(Ordering::Relaxed),
            in_flight: self.active.len(),
            waiting: self.waiting.len(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("index", &self.index)
            .field("executor", &self.executor.name())
            .field("waiting", &self.waiting.len())
            .field("active", &self.active.len())
            .finish()
    }
}
