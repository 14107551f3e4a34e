//! Engine: owner of the scheduler and the shared services.
//!
//! The engine constructs and owns the message bus, the obsolete key set,
//! the shutdown flag and (optionally) the cluster instruction channel.
//! Nothing here is a process global.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = EngineBuilder::new().with_config(EngineConfig::minimal()).build()?;
//! engine.register_stream(StreamDesc::compute(DeviceType::Cpu, 0), executor)?;
//! let x = engine.new_object(MemoryCase::host(), Shape::from([16]), DataType::Float32);
//! engine.submit(InstructionMsg::builder(desc, "fill").write(x.object_id()).build()?)?;
//! engine.barrier()?;
//! engine.shutdown()?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bus::{ActorMsgBus, BusConfig, BusStats};
use crate::config::EngineConfig;
use crate::control::{ClusterInstructionChannel, ControlPlane, ObsoleteKeySet};
use crate::error::{Result, VmError};
use crate::memory::ShutdownFlag;
use crate::message::InstructionMsg;
use crate::object::EagerBlobObject;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::stream::StreamExecutor;
use crate::stream_role::StreamDesc;
use crate::types::{ChainId, DataType, MemoryCase, ObjectId, Shape, StreamId};

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Bus counters.
    pub bus: BusStats,
    /// Time since construction.
    pub uptime: Duration,
}

/// The execution engine.
pub struct Engine {
    config: EngineConfig,
    scheduler: Scheduler,
    bus: Arc<ActorMsgBus>,
    obsolete_keys: Arc<ObsoleteKeySet>,
    cluster: Option<ClusterInstructionChannel>,
    shutdown: ShutdownFlag,
    running: bool,
    started_at: Instant,
}

impl Engine {
    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flag consulted by deallocation once shutdown begins.
    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Actor message bus.
    pub fn bus(&self) -> &Arc<ActorMsgBus> {
        &self.bus
    }

    /// Obsolete control keys.
    pub fn obsolete_keys(&self) -> &Arc<ObsoleteKeySet> {
        &self.obsolete_keys
    }

    /// Cluster instruction channel, if a control plane was attached.
    pub fn cluster(&self) -> Option<&ClusterInstructionChannel> {
        self.cluster.as_ref()
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The scheduler, mutably.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Whether the engine accepts work.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(VmError::ShuttingDown)
        }
    }

    /// Register a stream.
    pub fn register_stream(
        &mut self,
        desc: StreamDesc,
        executor: Arc<dyn StreamExecutor>,
    ) -> Result<StreamId> {
        self.ensure_running()?;
        self.scheduler.register_stream(desc, executor)
    }

    /// Make an existing object addressable by instructions.
    pub fn register_object(&mut self, object: &Arc<EagerBlobObject>) -> ObjectId {
        self.scheduler.register_object(object)
    }

    /// Create and register an object with fresh storage.
    pub fn new_object(&mut self, mem_case: MemoryCase, shape: Shape, data_type: DataType) -> Arc<EagerBlobObject> {
        let object = Arc::new(EagerBlobObject::with_new_storage(mem_case, shape, data_type));
        self.scheduler.register_object(&object);
        object
    }

    /// Admit an instruction into a fresh chain.
    pub fn submit(&mut self, msg: InstructionMsg) -> Result<ChainId> {
        self.ensure_running()?;
        self.scheduler.submit(msg)
    }

    /// Release an object's body on `stream`.
    ///
    /// Inserts a soft sync first when the stream type requires one, then the
    /// stream's release instruction. Returns the release chain.
    pub fn release_tensor(&mut self, object: ObjectId, stream: StreamDesc) -> Result<ChainId> {
        self.ensure_running()?;
        let name = stream.release_instruction_name()?;
        let release = InstructionMsg::builder(stream, name).write(object).build()?;
        if stream.need_soft_sync() {
            self.scheduler.submit(InstructionMsg::soft_sync(stream, object))?;
        }
        self.scheduler.submit(release)
    }

    /// One scheduling pass.
    pub fn schedule(&mut self) -> usize {
        self.scheduler.schedule()
    }

    /// Drain every in-flight package, then meet the other processes.
    pub fn barrier(&mut self) -> Result<()> {
        self.scheduler.run_until_idle()?;
        self.report_failures()?;
        if let Some(cluster) = &self.cluster {
            cluster.plane().barrier("engine")?;
        }
        Ok(())
    }

    /// Like [`Engine::barrier`] but gives up after `timeout`.
    pub fn barrier_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.scheduler.drain(Some(timeout))?;
        self.report_failures()?;
        if let Some(cluster) = &self.cluster {
            cluster.plane().barrier("engine")?;
        }
        Ok(())
    }

    fn report_failures(&mut self) -> Result<()> {
        let mut failures = self.scheduler.take_failures();
        if failures.len() > 1 {
            warn!(count = failures.len(), "multiple chains failed");
        }
        let result = match failures.drain(..).next() {
            Some(first) => Err(first),
            None => Ok(()),
        };
        result
    }

    /// Master: broadcast halt and wait for the cluster.
    pub fn halt(&mut self) -> Result<()> {
        self.barrier()?;
        match &self.cluster {
            Some(cluster) if cluster.plane().is_master() => cluster.master_send_halt(),
            Some(cluster) => cluster.halt_barrier(),
            None => Ok(()),
        }
    }

    /// Stop accepting work, drain, then mark the engine as shutting down.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.running {
            return Err(VmError::InvalidState {
                expected: "running".to_string(),
                actual: "stopped".to_string(),
            });
        }
        self.running = false;
        let drained = self.scheduler.run_until_idle();
        self.shutdown.set();
        let stats = self.scheduler.stats();
        info!(
            packages = stats.packages_completed,
            failed = stats.packages_failed,
            chains_failed = stats.chains_failed,
            uptime_ms = self.started_at.elapsed().as_millis() as u64,
            "engine shut down"
        );
        drained
    }

    /// Statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            scheduler: self.scheduler.stats(),
            bus: self.bus.stats(),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.running)
            .field("scheduler", &self.scheduler)
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    shutdown: Option<ShutdownFlag>,
}

impl EngineBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use [`EngineConfig::from_env`].
    pub fn from_env(mut self) -> Result<Self> {
        self.config = Some(EngineConfig::from_env()?);
        Ok(self)
    }

    /// Attach a control plane for cluster instructions.
    pub fn with_control_plane(mut self, plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(plane);
        self
    }

    /// Share a shutdown flag with device contexts created earlier.
    pub fn with_shutdown_flag(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bus = ActorMsgBus::new(BusConfig::from(&config));
        let obsolete_keys = Arc::new(ObsoleteKeySet::new());
        let cluster = self.control_plane.map(|plane| {
            ClusterInstructionChannel::new(plane, Arc::clone(&obsolete_keys), config.key_flush_interval)
        });
        let scheduler = Scheduler::new(config.clone());

        info!(
            max_chains_per_package = config.max_chains_per_package,
            max_in_flight_packages = config.max_in_flight_packages,
            debug_mode = config.debug_mode,
            cluster = cluster.is_some(),
            "engine started"
        );

        Ok(Engine {
            config,
            scheduler,
            bus,
            obsolete_keys,
            cluster,
            shutdown: self.shutdown.unwrap_or_default(),
            running: true,
            started_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::LocalControlPlane;
    use crate::message::SOFT_SYNC_OPCODE;
    use crate::stream::tests::ManualExecutor;
    use crate::stream_role::StreamRole;
    use crate::types::DeviceType;

    fn engine_with(desc: StreamDesc) -> (Engine, Arc<ManualExecutor>) {
        let mut engine = EngineBuilder::new().build().unwrap();
        let executor = Arc::new(ManualExecutor::default());
        engine
            .register_stream(desc, Arc::clone(&executor) as Arc<dyn StreamExecutor>)
            .unwrap();
        (engine, executor)
    }

    fn opcodes(engine: &Engine, chain: ChainId) -> Vec<String> {
        engine
            .scheduler()
            .chain(chain)
            .unwrap()
            .instructions()
            .iter()
            .map(|i| i.msg().opcode().to_string())
            .collect()
    }

    #[test]
    fn test_release_on_cpu_has_no_soft_sync() {
        let desc = StreamDesc::compute(DeviceType::Cpu, 0);
        let (mut engine, _executor) = engine_with(desc);
        let x = engine.new_object(MemoryCase::host(), Shape::from([4]), DataType::Float32);

        let chain = engine.release_tensor(x.object_id(), desc).unwrap();
        assert_eq!(opcodes(&engine, chain), vec!["cpu.ReleaseTensor"]);
        assert_eq!(engine.scheduler().live_chains(), 1);
    }

    #[test]
    fn test_release_on_accelerator_inserts_soft_sync() {
        let desc = StreamDesc::compute(DeviceType::Cuda, 0);
        let (mut engine, _executor) = engine_with(desc);
        let x = engine.new_object(MemoryCase::device(DeviceType::Cuda, 0), Shape::from([4]), DataType::Float32);

        let chain = engine.release_tensor(x.object_id(), desc).unwrap();
        assert_eq!(opcodes(&engine, chain), vec!["cuda.ReleaseTensor"]);
        assert_eq!(engine.scheduler().live_chains(), 2);
        let sync_chain = ChainId(chain.0 - 1);
        assert_eq!(opcodes(&engine, sync_chain), vec![SOFT_SYNC_OPCODE]);
        assert!(engine.scheduler().chain(chain).unwrap().in_edges().contains(&sync_chain));
    }

    #[test]
    fn test_release_on_h2d_requires_accelerator() {
        let desc = StreamDesc::new(StreamRole::Host2Device, DeviceType::Cpu, 0);
        let mut engine = EngineBuilder::new().build().unwrap();
        let x = engine.new_object(MemoryCase::host(), Shape::from([4]), DataType::Float32);
        let err = engine.release_tensor(x.object_id(), desc).unwrap_err();
        assert!(matches!(err, VmError::RoleDeviceMismatch { .. }));
    }

    #[test]
    fn test_shutdown_drains_and_sets_flag() {
        let desc = StreamDesc::compute(DeviceType::Cpu, 0);
        let (mut engine, executor) = engine_with(desc);
        let x = engine.new_object(MemoryCase::host(), Shape::from([4]), DataType::Float32);
        engine
            .submit(InstructionMsg::builder(desc, "fill").write(x.object_id()).build().unwrap())
            .unwrap();
        engine.schedule();
        executor.complete_all();

        engine.shutdown().unwrap();
        assert!(engine.shutdown_flag().is_shutting_down());
        assert!(!engine.is_running());
        assert_eq!(engine.stats().scheduler.packages_completed, 1);

        assert!(matches!(engine.shutdown(), Err(VmError::InvalidState { .. })));
        let err = engine
            .submit(InstructionMsg::builder(desc, "fill").write(x.object_id()).build().unwrap())
            .unwrap_err();
        assert_eq!(err, VmError::ShuttingDown);
    }

    #[test]
    fn test_barrier_reports_failure() {
        let desc = StreamDesc::compute(DeviceType::Cpu, 0);
        let (mut engine, executor) = engine_with(desc);
        let x = engine.new_object(MemoryCase::host(), Shape::from([4]), DataType::Float32);
        engine
            .submit(InstructionMsg::builder(desc, "fill").write(x.object_id()).build().unwrap())
            .unwrap();
        engine.schedule();
        executor.fail(1);
        assert!(matches!(engine.barrier(), Err(VmError::ExecutorError(_))));
        assert!(engine.barrier().is_ok());
    }

    #[test]
    fn test_halt_single_process() {
        let plane = LocalControlPlane::single();
        let mut engine = EngineBuilder::new()
            .with_control_plane(plane.clone())
            .build()
            .unwrap();
        engine.halt().unwrap();
        assert_eq!(plane.stored_keys(), 1);
        assert_eq!(engine.obsolete_keys().len(), 1);
    }
}
