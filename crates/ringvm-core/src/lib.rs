//! # RingVM Core
//!
//! Scheduling, storage and register-flow primitives for the RingVM
//! asynchronous tensor execution engine.
//!
//! ## Core Abstractions
//!
//! - [`StreamRole`] - per-role synchronization and release policy
//! - [`EagerBlobObject`] - lazily allocated tensor memory
//! - [`Scheduler`] - dependency tracking between instruction chains
//! - [`StreamExecutor`] - backend that runs packages and reports completion
//! - [`RegisterFlowActor`] - producer/consumer hand-off over the [`ActorMsgBus`]
//! - [`Engine`] - owner of the scheduler and shared services
//!
//! ## Example
//!
//! ```ignore
//! use ringvm_core::prelude::*;
//!
//! let mut engine = EngineBuilder::new().build()?;
//! engine.register_stream(StreamDesc::compute(DeviceType::Cpu, 0), executor)?;
//! let x = engine.new_object(MemoryCase::host(), Shape::from([8]), DataType::Float32);
//! let desc = StreamDesc::compute(DeviceType::Cpu, 0);
//! engine.submit(InstructionMsg::builder(desc, "fill").write(x.object_id()).build()?)?;
//! engine.barrier()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod actor;
pub mod bus;
pub mod chain;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod instruction;
pub mod kernel;
pub mod memory;
pub mod message;
pub mod object;
pub mod package;
pub mod scheduler;
pub mod stream;
pub mod stream_role;
pub mod types;

pub use actor::{ActorKernel, ActorMsg, RegisterFlowActor};
pub use bus::ActorMsgBus;
pub use engine::{Engine, EngineBuilder};
pub use error::{Result, VmError};
pub use object::EagerBlobObject;
pub use scheduler::Scheduler;
pub use stream::StreamExecutor;
pub use stream_role::{StreamDesc, StreamRole};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::actor::{
        ActContext, ActorKernel, ActorMsg, CopyKernel, OutputSlot, Register, RegisterFlowActor,
        RegisterHandle,
    };
    pub use crate::bus::{
        ActorEndpoint, ActorMsgBus, ActorMsgBusBuilder, BusConfig, BusMessage, BusStats,
        DeliveryReceipt, DeliveryStatus,
    };
    pub use crate::chain::{ChainState, InstrChain};
    pub use crate::config::{EngineConfig, EngineConfigBuilder};
    pub use crate::control::{
        ClusterInstruction, ClusterInstructionChannel, ControlPlane, LocalControlPlane,
        ObsoleteKeySet,
    };
    pub use crate::engine::{Engine, EngineBuilder, EngineStats};
    pub use crate::error::{Result, VmError};
    pub use crate::instruction::{AccessKind, Instruction};
    pub use crate::kernel::{InstructionKernel, InstructionTask, KernelContext, KernelRegistry};
    pub use crate::memory::{
        Allocator, BlobBuffer, DeviceContext, HostAllocator, HostDeviceContext, ShutdownFlag,
        BLOB_BODY_ALIGNMENT,
    };
    pub use crate::message::{
        InstructionId, InstructionMsg, InstructionMsgBuilder, Operand, StreamMask,
        INSTRUCTION_OPERAND_LIMIT, SOFT_SYNC_OPCODE,
    };
    pub use crate::object::{EagerBlobObject, ObjectRegistry, TensorStorage};
    pub use crate::package::{
        ChainPackage, CompletionStatus, StatusBuffer, STATUS_BUFFER_LENGTH,
    };
    pub use crate::scheduler::{Scheduler, SchedulerStats};
    pub use crate::stream::{
        ChainTask, CompletedPackage, PackageFailure, PackageLaunch, Stream, StreamExecutor,
        StreamStats,
    };
    pub use crate::stream_role::{StreamDesc, StreamRole};
    pub use crate::types::{
        ActorId, ChainId, DataType, DeviceType, MemoryCase, ObjectId, PackageId,
        RegisterDescId, Shape, StreamId,
    };
}
