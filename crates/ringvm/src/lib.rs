//! # RingVM
//!
//! Asynchronous instruction scheduling across typed streams, with
//! register-flow actors for producer/consumer pipelines.
//!
//! Instructions are admitted into chains. The scheduler orders chains that
//! touch the same object, batches ready chains into packages and launches
//! them on stream executors. Memory for each tensor is allocated lazily on
//! first write and released through a stream-specific release instruction.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringvm::prelude::*;
//!
//! ringvm::logging::init();
//!
//! let mut vm = RingVm::builder()
//!     .stream(StreamDesc::compute(DeviceType::Cpu, 0))
//!     .build()?;
//!
//! let desc = StreamDesc::compute(DeviceType::Cpu, 0);
//! let x = vm.engine_mut().new_object(MemoryCase::host(), Shape::from([4]), DataType::Float32);
//! vm.engine_mut().submit(
//!     InstructionMsg::builder(desc, "fill")
//!         .write(x.object_id())
//!         .operand(Operand::Double(1.0))
//!         .build()?,
//! )?;
//! vm.engine_mut().barrier()?;
//! assert_eq!(read_elements::<f32>(&x)?, vec![1.0; 4]);
//! vm.shutdown()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

pub use ringvm_core::*;

pub use ringvm_cpu::{
    host_registry, read_elements, register_host_kernels, write_elements, CpuRuntime,
    ExecutionMode, InlineExecutor, RuntimeMetrics, ThreadedExecutor,
};

use ringvm_core::config::EngineConfig;
use ringvm_core::control::ControlPlane;
use ringvm_core::engine::{Engine, EngineBuilder};
use ringvm_core::error::Result;
use ringvm_core::kernel::KernelRegistry;
use ringvm_core::stream_role::StreamDesc;
use ringvm_core::types::StreamId;
use std::sync::Arc;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{RingVm, RingVmBuilder};
    pub use ringvm_core::prelude::*;
    pub use ringvm_cpu::{
        host_registry, read_elements, write_elements, CpuRuntime, ExecutionMode,
    };
}

/// Log subscriber setup.
pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Install a formatting subscriber filtered by `RUST_LOG`.
    ///
    /// Falls back to `info` when `RUST_LOG` is unset. Does nothing if a
    /// global subscriber is already installed.
    pub fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        install(filter);
    }

    /// Like [`init`] but defaults to `debug` when `debug` is set.
    pub fn init_with_debug(debug: bool) {
        let fallback = if debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        install(filter);
    }

    fn install(filter: EnvFilter) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

/// An engine wired to the CPU runtime.
pub struct RingVm {
    engine: Engine,
    runtime: CpuRuntime,
    streams: Vec<StreamId>,
}

impl RingVm {
    /// Create a new builder.
    pub fn builder() -> RingVmBuilder {
        RingVmBuilder::new()
    }

    /// The engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The engine, mutably.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// The CPU runtime.
    pub fn runtime(&self) -> &CpuRuntime {
        &self.runtime
    }

    /// Streams registered at build time, in builder order.
    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    /// Add a stream after build.
    pub fn add_stream(&mut self, desc: StreamDesc) -> Result<StreamId> {
        let id = self.runtime.executor_for(desc).and_then(|executor| {
            self.engine.register_stream(desc, executor)
        })?;
        self.streams.push(id);
        Ok(id)
    }

    /// Shut down the engine, then stop the executors.
    pub fn shutdown(mut self) -> Result<()> {
        let drained = self.engine.shutdown();
        self.runtime.shutdown()?;
        drained
    }
}

impl std::fmt::Debug for RingVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingVm")
            .field("engine", &self.engine)
            .field("runtime", &self.runtime)
            .field("streams", &self.streams)
            .finish()
    }
}

/// Builder for [`RingVm`].
pub struct RingVmBuilder {
    engine: EngineBuilder,
    mode: ExecutionMode,
    registry: Option<KernelRegistry>,
    streams: Vec<StreamDesc>,
}

impl RingVmBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            engine: EngineBuilder::new(),
            mode: ExecutionMode::default(),
            registry: None,
            streams: Vec::new(),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.engine = self.engine.with_config(config);
        self
    }

    /// Apply `RINGVM_*` environment overrides to the configuration.
    pub fn from_env(mut self) -> Result<Self> {
        self.engine = self.engine.from_env()?;
        Ok(self)
    }

    /// Join a cluster through `plane`.
    #[must_use]
    pub fn control_plane(mut self, plane: Arc<dyn ControlPlane>) -> Self {
        self.engine = self.engine.with_control_plane(plane);
        self
    }

    /// Executor mode.
    #[must_use]
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Kernel registry. Defaults to the host kernels.
    #[must_use]
    pub fn registry(mut self, registry: KernelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a stream at build time.
    #[must_use]
    pub fn stream(mut self, desc: StreamDesc) -> Self {
        self.streams.push(desc);
        self
    }

    /// Build the engine and install the streams.
    pub fn build(self) -> Result<RingVm> {
        let mut engine = self.engine.build()?;
        let registry = self.registry.unwrap_or_else(host_registry);
        let runtime = CpuRuntime::with_registry(registry, engine.shutdown_flag().clone())
            .with_mode(self.mode);
        let streams = runtime.install(&mut engine, &self.streams)?;
        tracing::info!(streams = streams.len(), mode = ?self.mode, "ringvm ready");
        Ok(RingVm {
            engine,
            runtime,
            streams,
        })
    }
}

impl Default for RingVmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringvm_core::types::DeviceType;

    #[test]
    fn test_builder_installs_streams() {
        let vm = RingVm::builder()
            .mode(ExecutionMode::Inline)
            .stream(StreamDesc::compute(DeviceType::Cpu, 0))
            .stream(StreamDesc::compute(DeviceType::Cuda, 0))
            .build()
            .unwrap();
        assert_eq!(vm.streams().len(), 2);
        assert_eq!(vm.runtime().metrics().executors_created, 2);
        vm.shutdown().unwrap();
    }

    #[test]
    fn test_logging_init_is_idempotent() {
        logging::init();
        logging::init_with_debug(true);
    }
}
