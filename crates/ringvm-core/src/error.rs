//! Error types for RingVM.
//!
//! Only recoverable conditions live here. Broken scheduler invariants
//! (dangling object access, invalid stream role, mismatched in-place
//! forward) are not errors: they abort through a panic.

use thiserror::Error;

use crate::types::{ChainId, DeviceType, ObjectId};
use crate::stream_role::StreamRole;

/// Result alias used throughout RingVM.
pub type Result<T> = std::result::Result<T, VmError>;

/// RingVM error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Invalid configuration or request parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pinned memory requested for a tensor that does not live on the host.
    ///
    /// A configuration error with the offending device attached; see
    /// [`VmError::is_config_error`].
    #[error("cannot pin tensor with device: {device}, only dense CPU tensors can be pinned")]
    PinMemoryUnsupported {
        /// Device the tensor is placed on.
        device: DeviceType,
    },

    /// The execution context has no allocator for the requested memory kind.
    #[error("Allocator unavailable: {0}")]
    AllocatorUnavailable(String),

    /// The allocator could not satisfy the request.
    #[error("Failed to allocate {size} bytes on {device}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Device the allocation targeted.
        device: DeviceType,
    },

    /// A body buffer already exists but is smaller than the blob needs.
    #[error("Blob has been allocated {allocated} bytes, but {required} bytes are needed")]
    InsufficientStorage {
        /// Bytes required by shape and dtype.
        required: usize,
        /// Bytes already held by the storage.
        allocated: usize,
    },

    /// A stream role is not compatible with the device it was paired with.
    #[error("Stream role {role} is not supported on device {device}")]
    RoleDeviceMismatch {
        /// Stream role.
        role: StreamRole,
        /// Device type.
        device: DeviceType,
    },

    /// Functionality exists in the role table but has no handler.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Instruction message exceeds the operand limit.
    #[error("Operand limit exceeded: at most {limit} operands per instruction")]
    OperandLimitExceeded {
        /// Maximum number of operands.
        limit: usize,
    },

    /// A consumer reads an object written on a stream that requires a soft
    /// sync token, and no token was inserted.
    #[error("Missing soft sync: object {object} was written on a {role}/{device} stream without a sync token")]
    MissingSoftSync {
        /// Object read by the consumer.
        object: ObjectId,
        /// Role of the producing stream.
        role: StreamRole,
        /// Device of the producing stream.
        device: DeviceType,
    },

    /// No stream is registered for the requested descriptor.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Operation not valid in the current state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Bounded queue is full.
    #[error("Queue full (capacity: {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// Message bus delivery failed.
    #[error("Message bus error: {0}")]
    BusError(String),

    /// Executor reported a failure while running a chain.
    #[error("Executor error: {0}")]
    ExecutorError(String),

    /// A chain was discarded without running because a chain it waits on
    /// failed.
    #[error("{chain} discarded: dependency {failed} failed")]
    DependencyFailed {
        /// Discarded chain.
        chain: ChainId,
        /// Failed chain it waited on, directly or transitively.
        failed: ChainId,
    },

    /// Kernel for an opcode is not registered.
    #[error("No kernel registered for opcode '{0}'")]
    KernelNotFound(String),

    /// Engine is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl VmError {
    /// Returns true for invalid configuration or request parameters.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VmError::InvalidConfig(_) | VmError::PinMemoryUnsupported { .. }
        )
    }

    /// Returns true for errors caused by memory allocation.
    pub fn is_allocation_error(&self) -> bool {
        matches!(
            self,
            VmError::PinMemoryUnsupported { .. }
                | VmError::AllocatorUnavailable(_)
                | VmError::AllocationFailed { .. }
                | VmError::InsufficientStorage { .. }
        )
    }
}
