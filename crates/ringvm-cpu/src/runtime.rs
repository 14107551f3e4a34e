//! CPU runtime: device contexts and stream executors for an engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use ringvm_core::engine::Engine;
use ringvm_core::error::{Result, VmError};
use ringvm_core::kernel::KernelRegistry;
use ringvm_core::memory::{Allocator, DeviceContext, HostDeviceContext, ShutdownFlag};
use ringvm_core::stream::StreamExecutor;
use ringvm_core::stream_role::StreamDesc;
use ringvm_core::types::{DeviceType, StreamId};

use crate::device::SimulatedDeviceContext;
use crate::executor::{InlineExecutor, ThreadedExecutor};
use crate::kernels::host_registry;

/// How the runtime executes packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run each package inside `launch`.
    Inline,
    /// One worker thread per stream.
    #[default]
    Threaded,
}

/// Runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    /// Executors created.
    pub executors_created: u64,
    /// Threaded executors still running.
    pub executors_running: usize,
    /// Device contexts in use, the host included.
    pub devices: usize,
    /// Bytes held by host allocators.
    pub host_memory_used: usize,
    /// Bytes held by simulated accelerators.
    pub device_memory_used: usize,
}

/// Host implementation of every device the engine can address.
///
/// CPU streams run on the host context. Accelerator streams run on
/// simulated devices whose memory lives on the host.
pub struct CpuRuntime {
    mode: ExecutionMode,
    registry: Arc<KernelRegistry>,
    shutdown_flag: ShutdownFlag,
    host: Arc<HostDeviceContext>,
    devices: RwLock<HashMap<(DeviceType, u32), Arc<SimulatedDeviceContext>>>,
    threaded: RwLock<Vec<Arc<ThreadedExecutor>>>,
    executors_created: AtomicU64,
    stopped: RwLock<bool>,
}

impl CpuRuntime {
    /// Runtime with the host kernels, sharing `shutdown_flag` with the engine.
    pub fn new(shutdown_flag: ShutdownFlag) -> Self {
        Self::with_registry(host_registry(), shutdown_flag)
    }

    /// Runtime with a custom kernel registry.
    pub fn with_registry(registry: KernelRegistry, shutdown_flag: ShutdownFlag) -> Self {
        info!(kernels = registry.len(), "initializing CPU runtime");
        Self {
            mode: ExecutionMode::default(),
            registry: Arc::new(registry),
            host: Arc::new(HostDeviceContext::new(shutdown_flag.clone())),
            shutdown_flag,
            devices: RwLock::new(HashMap::new()),
            threaded: RwLock::new(Vec::new()),
            executors_created: AtomicU64::new(0),
            stopped: RwLock::new(false),
        }
    }

    /// Runtime bound to an engine's shutdown flag.
    pub fn for_engine(engine: &Engine) -> Self {
        Self::new(engine.shutdown_flag().clone())
    }

    /// Set the execution mode for executors created afterwards.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Kernel registry shared by every executor.
    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// Check if runtime is shut down.
    pub fn is_shutdown(&self) -> bool {
        *self.stopped.read()
    }

    /// Host context.
    pub fn host(&self) -> &Arc<HostDeviceContext> {
        &self.host
    }

    /// Context for a device, creating simulated accelerators on first use.
    pub fn device_context(&self, device_type: DeviceType, device_id: u32) -> Arc<dyn DeviceContext> {
        if device_type == DeviceType::Cpu {
            return Arc::clone(&self.host) as Arc<dyn DeviceContext>;
        }
        if let Some(ctx) = self.devices.read().get(&(device_type, device_id)) {
            return Arc::clone(ctx) as Arc<dyn DeviceContext>;
        }
        let mut devices = self.devices.write();
        let ctx = devices.entry((device_type, device_id)).or_insert_with(|| {
            debug!(device = %device_type, device_id, "creating simulated device");
            Arc::new(SimulatedDeviceContext::new(
                device_type,
                device_id,
                self.shutdown_flag.clone(),
            ))
        });
        Arc::clone(ctx) as Arc<dyn DeviceContext>
    }

    /// Create an executor for a stream.
    pub fn executor_for(&self, desc: StreamDesc) -> Result<Arc<dyn StreamExecutor>> {
        if self.is_shutdown() {
            return Err(VmError::ShuttingDown);
        }
        if !desc.role.supports_device(desc.device_type) {
            return Err(VmError::RoleDeviceMismatch {
                role: desc.role,
                device: desc.device_type,
            });
        }

        let device = self.device_context(desc.device_type, desc.device_id);
        let executor: Arc<dyn StreamExecutor> = match self.mode {
            ExecutionMode::Inline => Arc::new(InlineExecutor::new(Arc::clone(&self.registry), device)),
            ExecutionMode::Threaded => {
                let executor = Arc::new(ThreadedExecutor::spawn(Arc::clone(&self.registry), device)?);
                self.threaded.write().push(Arc::clone(&executor));
                executor
            }
        };
        self.executors_created.fetch_add(1, Ordering::Relaxed);
        debug!(stream = %desc, executor = executor.name(), "executor created");
        Ok(executor)
    }

    /// Register one stream per descriptor with `engine`.
    pub fn install(&self, engine: &mut Engine, descs: &[StreamDesc]) -> Result<Vec<StreamId>> {
        descs
            .iter()
            .map(|desc| {
                let executor = self.executor_for(*desc)?;
                engine.register_stream(*desc, executor)
            })
            .collect()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> RuntimeMetrics {
        let devices = self.devices.read();
        let host_memory_used = self.host.host_allocator().allocated_bytes()
            + self
                .host
                .pinned_allocator()
                .map(|a| a.allocated_bytes())
                .unwrap_or(0);
        RuntimeMetrics {
            executors_created: self.executors_created.load(Ordering::Relaxed),
            executors_running: self.threaded.read().iter().filter(|e| e.is_running()).count(),
            devices: devices.len() + 1,
            host_memory_used,
            device_memory_used: devices
                .values()
                .map(|d| d.device_allocator().allocated_bytes())
                .sum(),
        }
    }

    /// Stop every threaded executor.
    ///
    /// Call after the engine has drained. Executors already registered with
    /// an engine reject further launches.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut stopped = self.stopped.write();
            if *stopped {
                return Err(VmError::InvalidState {
                    expected: "running".to_string(),
                    actual: "stopped".to_string(),
                });
            }
            *stopped = true;
        }
        info!("shutting down CPU runtime");

        let executors: Vec<_> = self.threaded.write().drain(..).collect();
        for executor in &executors {
            executor.shutdown();
        }

        info!(executors = executors.len(), "CPU runtime shut down complete");
        Ok(())
    }
}

impl Drop for CpuRuntime {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            for executor in self.threaded.get_mut().drain(..) {
                executor.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for CpuRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuRuntime")
            .field("mode", &self.mode)
            .field("registry", &self.registry)
            .field("stopped", &self.is_shutdown())
            .finish()
    }
}
