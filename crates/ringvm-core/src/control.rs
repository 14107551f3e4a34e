//! Cluster control plane.
//!
//! The master process broadcasts [`ClusterInstruction`]s to workers through
//! a key-value store with barriers ([`ControlPlane`]). Every instruction is
//! pushed under a fresh sequential key because a key may only be written
//! once. Used keys accumulate in an [`ObsoleteKeySet`] and are flushed from
//! the store every `key_flush_interval` pushes, between two barriers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{Result, VmError};
use crate::message::InstructionMsg;

/// Prefix of the sequential instruction keys.
pub const CLUSTER_INSTRUCTION_KEY_PREFIX: &str = "ClusterInstructionKey/";

/// Command broadcast from the master to every worker.
#[derive(Debug, Clone)]
pub enum ClusterInstruction {
    /// A new session begins.
    SessionStart,
    /// Stop after the halt barrier.
    Halt,
    /// Stop immediately.
    Abort,
    /// Run these instructions on every worker.
    EagerInstruction(Vec<InstructionMsg>),
}

impl ClusterInstruction {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterInstruction::SessionStart => "session_start",
            ClusterInstruction::Halt => "halt",
            ClusterInstruction::Abort => "abort",
            ClusterInstruction::EagerInstruction(_) => "eager_instruction",
        }
    }
}

/// Key-value store with barriers shared by all processes.
pub trait ControlPlane: Send + Sync {
    /// Whether this process is the master.
    fn is_master(&self) -> bool;

    /// Block until every process reaches the barrier.
    fn barrier(&self, name: &str) -> Result<()>;

    /// Publish a value under `key` in the master store.
    fn push_kv(&self, key: &str, value: ClusterInstruction) -> Result<()>;

    /// Wait for `key` in the master store and read it.
    fn pull_kv(&self, key: &str) -> Result<ClusterInstruction>;

    /// Remove `key` from the master store.
    fn clear_master_kv(&self, key: &str) -> Result<()>;

    /// Remove every key this process can see.
    fn clear(&self) -> Result<()>;
}

/// Keys already used and waiting to be cleared.
#[derive(Debug, Default)]
pub struct ObsoleteKeySet {
    keys: Mutex<Vec<String>>,
}

impl ObsoleteKeySet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key.
    pub fn add(&self, key: impl Into<String>) {
        self.keys.lock().push(key.into());
    }

    /// Visit every key in insertion order.
    pub fn for_each(&self, mut f: impl FnMut(&str) -> Result<()>) -> Result<()> {
        let keys = self.keys.lock();
        for key in keys.iter() {
            f(key)?;
        }
        Ok(())
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.keys.lock().clear();
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Whether no key is pending.
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// Sequenced instruction exchange over a [`ControlPlane`].
pub struct ClusterInstructionChannel {
    plane: Arc<dyn ControlPlane>,
    obsolete: Arc<ObsoleteKeySet>,
    key_seq: AtomicU64,
    flush_seq: AtomicU64,
    flush_interval: u64,
}

impl ClusterInstructionChannel {
    /// Create a channel flushing obsolete keys every `flush_interval` uses.
    pub fn new(plane: Arc<dyn ControlPlane>, obsolete: Arc<ObsoleteKeySet>, flush_interval: u64) -> Self {
        Self {
            plane,
            obsolete,
            key_seq: AtomicU64::new(0),
            flush_seq: AtomicU64::new(0),
            flush_interval: flush_interval.max(1),
        }
    }

    /// The control plane.
    pub fn plane(&self) -> &Arc<dyn ControlPlane> {
        &self.plane
    }

    /// Keys waiting to be flushed.
    pub fn obsolete_keys(&self) -> &Arc<ObsoleteKeySet> {
        &self.obsolete
    }

    fn next_key(&self) -> String {
        format!(
            "{}{}",
            CLUSTER_INSTRUCTION_KEY_PREFIX,
            self.key_seq.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn occasionally_clear(&self, key: String) -> Result<()> {
        self.obsolete.add(key);
        // Flush on the second use of each interval so a flush never runs
        // before any key was written.
        let seq = self.flush_seq.fetch_add(1, Ordering::SeqCst);
        if seq % self.flush_interval != 1 % self.flush_interval {
            return Ok(());
        }
        self.plane.barrier("obsolete_keys_begin")?;
        if self.plane.is_master() {
            let plane = &self.plane;
            self.obsolete.for_each(|k| plane.clear_master_kv(k))?;
        }
        let flushed = self.obsolete.len();
        self.obsolete.clear();
        self.plane.barrier("obsolete_keys_end")?;
        debug!(flushed, "obsolete control keys flushed");
        Ok(())
    }

    fn push(&self, instruction: ClusterInstruction) -> Result<()> {
        let key = self.next_key();
        info!(key = %key, kind = instruction.kind(), "push cluster instruction");
        self.plane.push_kv(&key, instruction)?;
        self.occasionally_clear(key)
    }

    /// Master: announce a new session and wait for every worker.
    pub fn master_send_session_start(&self) -> Result<()> {
        self.push(ClusterInstruction::SessionStart)?;
        self.new_session_barrier()
    }

    /// Master: announce halt and wait for every worker to acknowledge.
    pub fn master_send_halt(&self) -> Result<()> {
        self.push(ClusterInstruction::Halt)?;
        self.halt_barrier()
    }

    /// Master: announce abort without waiting.
    pub fn master_send_abort(&self) -> Result<()> {
        error!("sending abort instruction");
        self.push(ClusterInstruction::Abort)
    }

    /// Master: broadcast eager instructions.
    pub fn master_send_eager_instruction(&self, instructions: Vec<InstructionMsg>) -> Result<()> {
        self.push(ClusterInstruction::EagerInstruction(instructions))
    }

    /// Worker: receive the next instruction.
    pub fn worker_receive_instruction(&self) -> Result<ClusterInstruction> {
        let key = self.next_key();
        info!(key = %key, "pull cluster instruction");
        let instruction = self.plane.pull_kv(&key)?;
        self.occasionally_clear(key)?;
        Ok(instruction)
    }

    /// Clear the store and obsolete keys between two barriers.
    pub fn new_session_barrier(&self) -> Result<()> {
        self.plane.barrier("new_session_begin")?;
        self.plane.clear()?;
        self.obsolete.clear();
        self.plane.barrier("new_session_end")
    }

    /// Barrier acknowledging a halt.
    pub fn halt_barrier(&self) -> Result<()> {
        self.plane.barrier("halt")
    }

    /// Barrier after eager instructions ran everywhere.
    pub fn eager_sync_barrier(&self) -> Result<()> {
        self.plane.barrier("eager_sync")
    }
}

impl fmt::Debug for ClusterInstructionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterInstructionChannel")
            .field("key_seq", &self.key_seq.load(Ordering::Relaxed))
            .field("obsolete_keys", &self.obsolete.len())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

struct LocalShared {
    store: Mutex<HashMap<String, ClusterInstruction>>,
    published: Condvar,
    barrier: Barrier,
    cleared: AtomicU64,
}

/// In-process control plane for a fixed number of participants.
///
/// Participant 0 is the master.
pub struct LocalControlPlane {
    rank: usize,
    shared: Arc<LocalShared>,
    pull_timeout: Duration,
}

impl LocalControlPlane {
    /// Default wait for a missing key.
    pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create handles for `participants` processes.
    pub fn cluster(participants: usize) -> Vec<Arc<LocalControlPlane>> {
        let participants = participants.max(1);
        let shared = Arc::new(LocalShared {
            store: Mutex::new(HashMap::new()),
            published: Condvar::new(),
            barrier: Barrier::new(participants),
            cleared: AtomicU64::new(0),
        });
        (0..participants)
            .map(|rank| {
                Arc::new(LocalControlPlane {
                    rank,
                    shared: Arc::clone(&shared),
                    pull_timeout: Self::DEFAULT_PULL_TIMEOUT,
                })
            })
            .collect()
    }

    /// Single-process control plane.
    pub fn single() -> Arc<LocalControlPlane> {
        Arc::new(LocalControlPlane {
            rank: 0,
            shared: Arc::new(LocalShared {
                store: Mutex::new(HashMap::new()),
                published: Condvar::new(),
                barrier: Barrier::new(1),
                cleared: AtomicU64::new(0),
            }),
            pull_timeout: Self::DEFAULT_PULL_TIMEOUT,
        })
    }

    /// Rank of this participant.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Keys currently stored.
    pub fn stored_keys(&self) -> usize {
        self.shared.store.lock().len()
    }

    /// Keys removed through `clear_master_kv`.
    pub fn cleared_keys(&self) -> u64 {
        self.shared.cleared.load(Ordering::Relaxed)
    }
}

impl ControlPlane for LocalControlPlane {
    fn is_master(&self) -> bool {
        self.rank == 0
    }

    fn barrier(&self, name: &str) -> Result<()> {
        debug!(rank = self.rank, barrier = name, "barrier");
        self.shared.barrier.wait();
        Ok(())
    }

    fn push_kv(&self, key: &str, value: ClusterInstruction) -> Result<()> {
        let mut store = self.shared.store.lock();
        if store.contains_key(key) {
            return Err(VmError::InvalidState {
                expected: format!("unused key {}", key),
                actual: "key already pushed".to_string(),
            });
        }
        store.insert(key.to_string(), value);
        self.shared.published.notify_all();
        Ok(())
    }

    fn pull_kv(&self, key: &str) -> Result<ClusterInstruction> {
        let mut store = self.shared.store.lock();
        loop {
            if let Some(value) = store.get(key) {
                return Ok(value.clone());
            }
            if self
                .shared
                .published
                .wait_for(&mut store, self.pull_timeout)
                .timed_out()
            {
                return Err(VmError::InvalidState {
                    expected: format!("key {}", key),
                    actual: format!("nothing published after {:?}", self.pull_timeout),
                });
            }
        }
    }

    fn clear_master_kv(&self, key: &str) -> Result<()> {
        if self.shared.store.lock().remove(key).is_some() {
            self.shared.cleared.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.shared.store.lock().clear();
        Ok(())
    }
}

impl fmt::Debug for LocalControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalControlPlane")
            .field("rank", &self.rank)
            .field("stored_keys", &self.stored_keys())
            .finish()
    }
}
