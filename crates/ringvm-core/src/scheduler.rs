//! Dependency scheduler.
//!
//! The scheduler owns every live chain, the per-object access history, and
//! the registered streams. Admission links a new instruction's chain after
//! every live chain whose access to the same object conflicts with it.
//! [`Scheduler::schedule`] observes completed packages, releases their
//! dependents, and batches ready chains into packages per stream.
//!
//! All state is private to the owning thread (`&mut self`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::chain::{ChainState, InstrChain};
use crate::config::EngineConfig;
use crate::error::{Result, VmError};
use crate::instruction::{AccessKind, Instruction};
use crate::message::{InstructionMsg, StreamMask};
use crate::object::{EagerBlobObject, ObjectRegistry};
use crate::package::ChainPackage;
use crate::stream::{ChainTask, CompletedPackage, PackageLaunch, Stream, StreamExecutor, StreamStats};
use crate::stream_role::StreamDesc;
use crate::types::{ChainId, ObjectId, PackageId, StreamId};

macro_rules! route {
    ($debug_mode:expr, $($arg:tt)+) => {
        if $debug_mode {
            debug!($($arg)+);
        } else {
            trace!($($arg)+);
        }
    };
}

/// Access history of one object among live chains.
#[derive(Debug, Default)]
struct AccessTrack {
    last_writer: Option<ChainId>,
    readers: BTreeSet<ChainId>,
    /// Stream whose write has not been followed by a soft sync yet.
    unsynced: Option<(StreamId, StreamDesc)>,
}

impl AccessTrack {
    fn is_empty(&self) -> bool {
        self.last_writer.is_none() && self.readers.is_empty() && self.unsynced.is_none()
    }

    fn forget_chain(&mut self, chain: ChainId) {
        if self.last_writer == Some(chain) {
            self.last_writer = None;
        }
        self.readers.remove(&chain);
    }
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    chains_created: u64,
    instructions_admitted: u64,
    edges_created: u64,
    packages_dispatched: u64,
    packages_completed: u64,
    packages_failed: u64,
    chains_failed: u64,
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Chains created.
    pub chains_created: u64,
    /// Instructions admitted.
    pub instructions_admitted: u64,
    /// Dependency edges created.
    pub edges_created: u64,
    /// Packages handed to streams.
    pub packages_dispatched: u64,
    /// Packages whose completion was observed.
    pub packages_completed: u64,
    /// Completed packages with at least one failed chain.
    pub packages_failed: u64,
    /// Chains that failed or were discarded behind a failed chain.
    pub chains_failed: u64,
    /// Chains not yet retired.
    pub live_chains: usize,
    /// Objects with live access history.
    pub tracked_objects: usize,
    /// Per-stream counters.
    pub streams: Vec<StreamStats>,
}

/// Instruction scheduler.
pub struct Scheduler {
    config: EngineConfig,
    objects: ObjectRegistry,
    streams: BTreeMap<StreamId, Stream>,
    streams_by_desc: HashMap<StreamDesc, Vec<StreamId>>,
    chains: BTreeMap<ChainId, InstrChain>,
    tracks: HashMap<ObjectId, AccessTrack>,
    next_stream: u64,
    next_chain: u64,
    next_package: u64,
    failed_chains: BTreeSet<ChainId>,
    failures: Vec<VmError>,
    counters: SchedulerCounters,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            objects: ObjectRegistry::new(),
            streams: BTreeMap::new(),
            streams_by_desc: HashMap::new(),
            chains: BTreeMap::new(),
            tracks: HashMap::new(),
            next_stream: 0,
            next_chain: 0,
            next_package: 0,
            failed_chains: BTreeSet::new(),
            failures: Vec::new(),
            counters: SchedulerCounters::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Object registry.
    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// Make an object addressable by instructions.
    pub fn register_object(&mut self, object: &Arc<EagerBlobObject>) -> ObjectId {
        self.objects.insert(object)
    }

    /// Forget an object and its access history.
    pub fn unregister_object(&mut self, id: ObjectId) -> bool {
        self.tracks.remove(&id);
        self.objects.remove(id)
    }

    /// Register a stream of type `desc` driven by `executor`.
    pub fn register_stream(
        &mut self,
        desc: StreamDesc,
        executor: Arc<dyn StreamExecutor>,
    ) -> Result<StreamId> {
        if !desc.role.supports_device(desc.device_type) {
            return Err(VmError::RoleDeviceMismatch {
                role: desc.role,
                device: desc.device_type,
            });
        }
        let id = StreamId(self.next_stream);
        self.next_stream += 1;

        let siblings = self.streams_by_desc.entry(desc).or_default();
        let index = siblings.len();
        siblings.push(id);
        self.streams.insert(
            id,
            Stream::new(id, desc, index, executor, self.config.max_in_flight_packages),
        );
        info!(stream = %id, %desc, index, "stream registered");
        Ok(id)
    }

    /// Stream by id.
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Streams of a given type, in mask index order.
    pub fn streams_of(&self, desc: StreamDesc) -> &[StreamId] {
        self.streams_by_desc
            .get(&desc)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pick the stream an instruction targets.
    pub fn select_stream(&self, desc: StreamDesc, mask: StreamMask) -> Result<StreamId> {
        let candidates = self.streams_of(desc);
        mask.first_enabled(candidates.len())
            .map(|index| candidates[index])
            .ok_or_else(|| VmError::StreamNotFound(format!("{} (mask {:#x})", desc, mask.0)))
    }

    /// Open an empty chain on `stream`.
    pub fn new_chain(&mut self, stream: StreamId) -> Result<ChainId> {
        if !self.streams.contains_key(&stream) {
            return Err(VmError::StreamNotFound(stream.to_string()));
        }
        let id = ChainId(self.next_chain);
        self.next_chain += 1;
        self.chains.insert(id, InstrChain::new(id, stream));
        self.counters.chains_created += 1;
        Ok(id)
    }

    /// Live chain by id.
    pub fn chain(&self, id: ChainId) -> Option<&InstrChain> {
        self.chains.get(&id)
    }

    /// State of a chain.
    ///
    /// Retired chains report [`ChainState::Done`] or [`ChainState::Failed`].
    /// Ids never handed out report `None`.
    pub fn chain_state(&self, id: ChainId) -> Option<ChainState> {
        match self.chains.get(&id) {
            Some(chain) => Some(chain.state()),
            None if self.failed_chains.contains(&id) => Some(ChainState::Failed),
            None if id.0 < self.next_chain => Some(ChainState::Done),
            None => None,
        }
    }

    /// Chains not yet retired.
    pub fn live_chains(&self) -> usize {
        self.chains.len()
    }

    /// Append an instruction to `chain` and link its dependencies.
    ///
    /// # Panics
    ///
    /// Panics if the message targets a role without a handler, or if an
    /// operand references an object that is not live.
    pub fn admit_instruction(&mut self, msg: InstructionMsg, chain_id: ChainId) -> Result<()> {
        let desc = msg.stream_desc();
        if !desc.role.is_schedulable() {
            error!(%desc, opcode = msg.opcode(), "instruction admitted on a role without handler");
            panic!("cannot admit {} on {} stream", msg.opcode(), desc);
        }

        let (stream_id, stream_desc) = {
            let chain = self.chains.get(&chain_id).ok_or_else(|| VmError::InvalidState {
                expected: "live chain".to_string(),
                actual: format!("{} retired", chain_id),
            })?;
            if chain.state() != ChainState::Pending {
                return Err(VmError::InvalidState {
                    expected: ChainState::Pending.to_string(),
                    actual: chain.state().to_string(),
                });
            }
            let stream = chain.stream_id();
            let stream_desc = self
                .streams
                .get(&stream)
                .map(Stream::desc)
                .ok_or_else(|| VmError::StreamNotFound(stream.to_string()))?;
            (stream, stream_desc)
        };
        if stream_desc != desc {
            return Err(VmError::InvalidState {
                expected: stream_desc.to_string(),
                actual: desc.to_string(),
            });
        }

        let instruction = Instruction::new(msg, chain_id, &self.objects);
        let is_soft_sync = instruction.msg().is_soft_sync();

        let mut sources = BTreeSet::new();
        for (object, access) in instruction.accesses() {
            let Some(track) = self.tracks.get(&object) else {
                continue;
            };
            if !is_soft_sync {
                if let Some((producer, producer_desc)) = track.unsynced {
                    if producer != stream_id {
                        if self.config.strict_soft_sync {
                            warn!(%object, producer = %producer_desc, consumer = %desc, "missing soft sync");
                            return Err(VmError::MissingSoftSync {
                                object,
                                role: producer_desc.role,
                                device: producer_desc.device_type,
                            });
                        }
                        warn!(%object, producer = %producer_desc, consumer = %desc, "consuming without soft sync");
                    }
                }
            }
            sources.extend(track.last_writer);
            if access.kind() == AccessKind::Write {
                sources.extend(track.readers.iter().copied());
            }
        }
        sources.retain(|src| *src != chain_id && self.chains.contains_key(src));

        if let Some(src) = sources.iter().find(|src| self.depends_on(**src, chain_id)) {
            return Err(VmError::InvalidState {
                expected: format!("{} independent of {}", src, chain_id),
                actual: format!("{} already waits on {}", src, chain_id),
            });
        }

        for src in &sources {
            let added = self
                .chains
                .get_mut(src)
                .map(|chain| chain.add_out_edge(chain_id))
                .unwrap_or(false);
            if added {
                if let Some(dst) = self.chains.get_mut(&chain_id) {
                    dst.add_in_edge(*src);
                }
                self.counters.edges_created += 1;
                route!(self.config.debug_mode, src = %src, dst = %chain_id, "edge");
            }
        }

        let need_soft_sync = desc.need_soft_sync();
        for (object, access) in instruction.accesses() {
            let track = self.tracks.entry(object).or_default();
            match access.kind() {
                AccessKind::Write => {
                    track.last_writer = Some(chain_id);
                    track.readers.clear();
                }
                AccessKind::Read => {
                    track.readers.insert(chain_id);
                }
            }
            if is_soft_sync {
                if matches!(track.unsynced, Some((producer, _)) if producer == stream_id) {
                    track.unsynced = None;
                }
            } else if access.kind() == AccessKind::Write {
                track.unsynced = need_soft_sync.then_some((stream_id, desc));
            }
        }

        route!(
            self.config.debug_mode,
            chain = %chain_id,
            stream = %stream_id,
            opcode = instruction.msg().opcode(),
            in_edges = sources.len(),
            "instruction admitted"
        );
        if let Some(chain) = self.chains.get_mut(&chain_id) {
            chain.push_instruction(instruction);
        }
        self.counters.instructions_admitted += 1;
        Ok(())
    }

    /// Admit `msg` into a fresh chain on the stream it selects.
    ///
    /// A soft sync goes to the stream holding the unsynced write of its
    /// object when that stream has the requested type, whatever the mask.
    /// On error the chain is discarded and its id is handed out again.
    pub fn submit(&mut self, msg: InstructionMsg) -> Result<ChainId> {
        let stream = match self.soft_sync_target(&msg) {
            Some(producer) => producer,
            None => self.select_stream(msg.stream_desc(), msg.stream_mask())?,
        };
        let chain = self.new_chain(stream)?;
        if let Err(e) = self.admit_instruction(msg, chain) {
            self.chains.remove(&chain);
            self.next_chain -= 1;
            self.counters.chains_created -= 1;
            return Err(e);
        }
        Ok(chain)
    }

    fn soft_sync_target(&self, msg: &InstructionMsg) -> Option<StreamId> {
        if !msg.is_soft_sync() {
            return None;
        }
        msg.operands()
            .iter()
            .filter_map(|operand| operand.object())
            .find_map(|object| match self.tracks.get(&object)?.unsynced {
                Some((producer, desc)) if desc == msg.stream_desc() => Some(producer),
                _ => None,
            })
    }

    /// Whether `chain` transitively waits on `target`.
    fn depends_on(&self, chain: ChainId, target: ChainId) -> bool {
        let mut stack = vec![chain];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(c) = self.chains.get(&id) {
                stack.extend(c.in_edges().iter().copied());
            }
        }
        false
    }

    /// One scheduling pass.
    ///
    /// Returns the number of packages completed, dispatched, or launched.
    pub fn schedule(&mut self) -> usize {
        let mut completed = Vec::new();
        for stream in self.streams.values_mut() {
            completed.extend(stream.poll_done());
        }
        let mut progress = completed.len();
        for package in completed {
            self.retire_package(package);
        }

        progress += self.dispatch_ready();
        for stream in self.streams.values_mut() {
            progress += stream.pump();
        }
        progress
    }

    /// Retire the chains of a completed package.
    ///
    /// Completed chains release their dependents. A failed chain takes every
    /// chain waiting on it, directly or transitively, down with it.
    fn retire_package(&mut self, completed: CompletedPackage) {
        let CompletedPackage { package, failure } = completed;
        self.counters.packages_completed += 1;
        let mut failed: BTreeMap<ChainId, VmError> = BTreeMap::new();
        if let Some(failure) = failure {
            self.counters.packages_failed += 1;
            for (chain, e) in failure.chains {
                if !package.chains().contains(&chain) {
                    error!(chain = %chain, package = %package.id(), "failure names a chain outside the package");
                    panic!("{} reported failure of foreign {}", package.id(), chain);
                }
                failed.entry(chain).or_insert(e);
            }
        }

        for chain_id in package.chains() {
            match failed.remove(chain_id) {
                None => {
                    for dst in self.retire_chain(*chain_id, ChainState::Done) {
                        if let Some(waiting) = self.chains.get_mut(&dst) {
                            waiting.resolve_in_edge(*chain_id);
                        }
                    }
                    route!(self.config.debug_mode, chain = %chain_id, "chain done");
                }
                Some(e) => {
                    error!(package = %package.id(), chain = %chain_id, error = %e, "chain failed");
                    self.failures.push(e);
                    self.fail_dependents(*chain_id);
                }
            }
        }
    }

    fn fail_dependents(&mut self, root: ChainId) {
        let mut stack: Vec<ChainId> = self
            .retire_chain(root, ChainState::Failed)
            .into_iter()
            .collect();
        while let Some(dst) = stack.pop() {
            if !self.chains.contains_key(&dst) {
                continue;
            }
            warn!(chain = %dst, failed = %root, "discarding chain behind failed dependency");
            self.failures.push(VmError::DependencyFailed {
                chain: dst,
                failed: root,
            });
            stack.extend(self.retire_chain(dst, ChainState::Failed));
        }
    }

    /// Remove a live chain, forget its accesses, and return its out-edges.
    fn retire_chain(&mut self, chain_id: ChainId, state: ChainState) -> BTreeSet<ChainId> {
        let Some(mut chain) = self.chains.remove(&chain_id) else {
            error!(chain = %chain_id, "retiring unknown chain");
            panic!("{} retired but not live", chain_id);
        };
        chain.set_state(state);
        if state == ChainState::Failed {
            self.failed_chains.insert(chain_id);
            self.counters.chains_failed += 1;
        }

        let touched: Vec<ObjectId> = chain
            .instructions()
            .iter()
            .flat_map(|instr| instr.accesses().map(|(id, _)| id))
            .collect();
        for object in touched {
            if let Some(track) = self.tracks.get_mut(&object) {
                track.forget_chain(chain_id);
                if track.is_empty() {
                    self.tracks.remove(&object);
                }
            }
        }
        chain.release_instructions();
        chain.take_out_edges()
    }

    fn dispatch_ready(&mut self) -> usize {
        let mut ready: BTreeMap<StreamId, Vec<ChainId>> = BTreeMap::new();
        for chain in self.chains.values() {
            if chain.is_ready() && !chain.instructions().is_empty() {
                ready.entry(chain.stream_id()).or_default().push(chain.id());
            }
        }

        let batch_size = self.config.max_chains_per_package.max(1);
        let mut dispatched = 0;
        for (stream_id, ids) in ready {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            for batch in ids.chunks(batch_size) {
                if !stream.has_capacity() {
                    break;
                }
                let package_id = PackageId(self.next_package);
                self.next_package += 1;

                let mut tasks = Vec::with_capacity(batch.len());
                for id in batch {
                    let Some(chain) = self.chains.get_mut(id) else {
                        continue;
                    };
                    if chain.unresolved_in_edges() != 0 {
                        error!(chain = %id, in_edges = chain.unresolved_in_edges(), "false dispatch");
                        panic!("{} dispatched with unresolved in-edges", id);
                    }
                    chain.set_state(ChainState::Dispatched);
                    tasks.push(ChainTask::from_chain(chain));
                }

                let desc = stream.desc();
                let package = ChainPackage::new(package_id, stream_id, desc, batch.to_vec());
                stream.enqueue(
                    package,
                    PackageLaunch {
                        package: package_id,
                        stream: desc,
                        chains: tasks,
                    },
                );
                self.counters.packages_dispatched += 1;
                dispatched += 1;
                route!(
                    self.config.debug_mode,
                    package = %package_id,
                    stream = %stream_id,
                    chains = batch.len(),
                    "package dispatched"
                );
            }
        }
        dispatched
    }

    /// No live non-empty chain and every stream idle.
    pub fn is_idle(&self) -> bool {
        self.streams.values().all(Stream::is_idle)
            && self.chains.values().all(|c| c.instructions().is_empty())
    }

    /// Schedule until idle. Blocks forever if an executor never completes.
    pub fn run_until_idle(&mut self) -> Result<()> {
        self.drain(None)
    }

    /// Schedule until idle or until `timeout` elapses.
    pub fn drain(&mut self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            let progress = self.schedule();
            if self.is_idle() {
                return Ok(());
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(VmError::InvalidState {
                        expected: "idle scheduler".to_string(),
                        actual: format!("{} live chains after {:?}", self.chains.len(), limit),
                    });
                }
            }
            if progress == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Take the errors of failed and discarded chains, in retirement order.
    pub fn take_failures(&mut self) -> Vec<VmError> {
        std::mem::take(&mut self.failures)
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            chains_created: self.counters.chains_created,
            instructions_admitted: self.counters.instructions_admitted,
            edges_created: self.counters.edges_created,
            packages_dispatched: self.counters.packages_dispatched,
            packages_completed: self.counters.packages_completed,
            packages_failed: self.counters.packages_failed,
            chains_failed: self.counters.chains_failed,
            live_chains: self.chains.len(),
            tracked_objects: self.tracks.len(),
            streams: self.streams.values().map(Stream::stats).collect(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("streams", &self.streams.len())
            .field("live_chains", &self.chains.len())
            .field("tracked_objects", &self.tracks.len())
            .finish()
    }
}
