//! Chain packages and their completion status buffer.
//!
//! A package is the unit a stream executes: one or more ready chains plus a
//! fixed-size status buffer the executor writes completion information into.
//! The encoding of the buffer belongs to the executor. [`CompletionStatus`]
//! is the encoding used by the bundled executors.

use bytemuck::{Pod, Zeroable};

use crate::stream_role::StreamDesc;
use crate::types::{ChainId, PackageId, StreamId};

/// Size of the status buffer in bytes.
pub const STATUS_BUFFER_LENGTH: usize = 1024;

/// Opaque completion status written by a stream executor.
#[derive(Clone)]
pub struct StatusBuffer {
    bytes: [u8; STATUS_BUFFER_LENGTH],
}

impl StatusBuffer {
    /// Zeroed buffer.
    pub fn new() -> Self {
        Self {
            bytes: [0u8; STATUS_BUFFER_LENGTH],
        }
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; STATUS_BUFFER_LENGTH] {
        &self.bytes
    }

    /// Raw bytes, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; STATUS_BUFFER_LENGTH] {
        &mut self.bytes
    }

    /// Decode a plain-old-data header from the start of the buffer.
    pub fn read<T: Pod>(&self) -> T {
        let len = std::mem::size_of::<T>();
        assert!(len <= STATUS_BUFFER_LENGTH, "status header too large");
        bytemuck::pod_read_unaligned(&self.bytes[..len])
    }

    /// Encode a plain-old-data header at the start of the buffer.
    pub fn write<T: Pod>(&mut self, value: &T) {
        let src = bytemuck::bytes_of(value);
        assert!(src.len() <= STATUS_BUFFER_LENGTH, "status header too large");
        self.bytes[..src.len()].copy_from_slice(src);
    }

    /// Zero the buffer.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl Default for StatusBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBuffer")
            .field("header", &self.read::<CompletionStatus>())
            .finish()
    }
}

/// Status header used by the bundled executors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CompletionStatus {
    /// Executor ticket identifying the launch.
    pub ticket: u64,
    /// One of the `STATE_*` constants.
    pub state: u32,
    /// Executor error code, zero on success.
    pub error_code: u32,
    /// Chains in the package.
    pub chains_total: u32,
    /// Chains that ran every instruction.
    pub chains_completed: u32,
    /// Chains stopped by a failing instruction.
    pub chains_failed: u32,
    /// Zero.
    pub reserved: u32,
}

impl CompletionStatus {
    /// Buffer initialized, nothing launched.
    pub const STATE_IDLE: u32 = 0;
    /// Launched and running.
    pub const STATE_LAUNCHED: u32 = 1;
    /// All chains finished.
    pub const STATE_DONE: u32 = 2;
    /// Every chain ended and at least one failed.
    pub const STATE_FAILED: u32 = 3;

    /// Whether the package has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, Self::STATE_DONE | Self::STATE_FAILED)
            && self.chains_completed + self.chains_failed >= self.chains_total
    }
}

/// A batch of chains executed together on one stream.
#[derive(Debug)]
pub struct ChainPackage {
    id: PackageId,
    stream: StreamId,
    stream_desc: StreamDesc,
    chains: Vec<ChainId>,
    status: StatusBuffer,
    completion_observed: bool,
}

impl ChainPackage {
    /// Create a package.
    pub fn new(id: PackageId, stream: StreamId, stream_desc: StreamDesc, chains: Vec<ChainId>) -> Self {
        Self {
            id,
            stream,
            stream_desc,
            chains,
            status: StatusBuffer::new(),
            completion_observed: false,
        }
    }

    /// Package id.
    pub fn id(&self) -> PackageId {
        self.id
    }

    /// Target stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Stream type of the target stream.
    pub fn stream_desc(&self) -> StreamDesc {
        self.stream_desc
    }

    /// Chains in execution order.
    pub fn chains(&self) -> &[ChainId] {
        &self.chains
    }

    /// Number of chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether the package holds no chains.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Status buffer.
    pub fn status(&self) -> &StatusBuffer {
        &self.status
    }

    /// Status buffer, mutably.
    pub fn status_mut(&mut self) -> &mut StatusBuffer {
        &mut self.status
    }

    /// Record that completion has been observed.
    ///
    /// Returns false if it had already been observed.
    pub fn mark_completion_observed(&mut self) -> bool {
        !std::mem::replace(&mut self.completion_observed, true)
    }

    /// Whether completion has been observed.
    pub fn completion_observed(&self) -> bool {
        self.completion_observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    #[test]
    fn test_status_header_roundtrip() {
        let mut buffer = StatusBuffer::new();
        assert_eq!(buffer.read::<CompletionStatus>(), CompletionStatus::default());

        let status = CompletionStatus {
            ticket: 42,
            state: CompletionStatus::STATE_DONE,
            error_code: 0,
            chains_total: 3,
            chains_completed: 3,
            ..Default::default()
        };
        buffer.write(&status);
        assert_eq!(buffer.read::<CompletionStatus>(), status);
        assert!(buffer.read::<CompletionStatus>().is_finished());

        buffer.clear();
        assert!(!buffer.read::<CompletionStatus>().is_finished());
    }

    #[test]
    fn test_partial_completion_not_finished() {
        let status = CompletionStatus {
            state: CompletionStatus::STATE_DONE,
            chains_total: 2,
            chains_completed: 1,
            ..Default::default()
        };
        assert!(!status.is_finished());
    }

    #[test]
    fn test_failed_chains_count_toward_finish() {
        let status = CompletionStatus {
            state: CompletionStatus::STATE_FAILED,
            chains_total: 3,
            chains_completed: 2,
            chains_failed: 1,
            ..Default::default()
        };
        assert!(status.is_finished());
        assert!(!CompletionStatus {
            chains_failed: 0,
            ..status
        }
        .is_finished());
    }

    #[test]
    fn test_completion_observed_once() {
        let mut pkg = ChainPackage::new(
            PackageId(0),
            StreamId(0),
            StreamDesc::compute(DeviceType::Cpu, 0),
            vec![ChainId(0)],
        );
        assert!(pkg.mark_completion_observed());
        assert!(!pkg.mark_completion_observed());
        assert!(pkg.completion_observed());
    }
}
