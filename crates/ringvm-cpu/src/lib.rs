//! # RingVM CPU Backend
//!
//! Host execution for RingVM streams. CPU streams run on host memory, and
//! accelerator streams run on simulated devices backed by host memory, so
//! the full scheduler can be exercised without GPU hardware.
//!
//! ```ignore
//! use ringvm_core::prelude::*;
//! use ringvm_cpu::CpuRuntime;
//!
//! let mut engine = EngineBuilder::new().build()?;
//! let runtime = CpuRuntime::for_engine(&engine);
//! runtime.install(&mut engine, &[StreamDesc::compute(DeviceType::Cpu, 0)])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod executor;
pub mod kernels;
pub mod runtime;

pub use device::{SimulatedAllocator, SimulatedDeviceContext};
pub use executor::{ExecutorStats, InlineExecutor, ThreadedExecutor};
pub use kernels::{host_registry, read_elements, register_host_kernels, write_elements};
pub use runtime::{CpuRuntime, ExecutionMode, RuntimeMetrics};
