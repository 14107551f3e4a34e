//! Simulated accelerator memory.
//!
//! Accelerator bodies live in host memory. Each simulated device has a
//! fixed capacity so allocation failures can be exercised.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use ringvm_core::error::{Result, VmError};
use ringvm_core::memory::{
    Allocator, BlobBuffer, DeviceContext, HostMemory, ShutdownFlag, BLOB_BODY_ALIGNMENT,
};
use ringvm_core::types::DeviceType;

/// Default capacity of a simulated device: 1 GiB.
pub const DEFAULT_DEVICE_CAPACITY: usize = 1 << 30;

/// Host-backed allocator standing in for device memory.
#[derive(Debug)]
pub struct SimulatedAllocator {
    device_type: DeviceType,
    device_id: u32,
    capacity: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
}

impl SimulatedAllocator {
    /// Create an allocator with `capacity` bytes.
    pub fn new(device_type: DeviceType, device_id: u32, capacity: usize) -> Self {
        Self {
            device_type,
            device_id,
            capacity,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest number of bytes held at once.
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl Allocator for SimulatedAllocator {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn allocate(&self, size: usize) -> Result<Box<dyn BlobBuffer>> {
        let reserved = self
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current
                    .checked_add(size)
                    .filter(|total| *total <= self.capacity)
            })
            .map_err(|current| {
                warn!(
                    device = %self.device_type,
                    device_id = self.device_id,
                    requested = size,
                    in_use = current,
                    capacity = self.capacity,
                    "simulated device out of memory"
                );
                VmError::AllocationFailed {
                    size,
                    device: self.device_type,
                }
            })?;

        match HostMemory::new(size, BLOB_BODY_ALIGNMENT, false) {
            Ok(mem) => {
                self.peak.fetch_max(reserved + size, Ordering::Relaxed);
                debug!(device = %self.device_type, device_id = self.device_id, bytes = size, "device alloc");
                Ok(Box::new(mem))
            }
            Err(e) => {
                self.allocated.fetch_sub(size, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn deallocate(&self, buffer: Box<dyn BlobBuffer>) {
        self.allocated.fetch_sub(buffer.size(), Ordering::SeqCst);
        drop(buffer);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}

/// Execution context of a simulated accelerator.
///
/// Has no pinned allocator: pinning only applies to host contexts.
pub struct SimulatedDeviceContext {
    device_type: DeviceType,
    device_id: u32,
    allocator: Arc<SimulatedAllocator>,
    shutdown: ShutdownFlag,
}

impl SimulatedDeviceContext {
    /// Context with the default capacity.
    pub fn new(device_type: DeviceType, device_id: u32, shutdown: ShutdownFlag) -> Self {
        Self::with_capacity(device_type, device_id, DEFAULT_DEVICE_CAPACITY, shutdown)
    }

    /// Context with `capacity` bytes of device memory.
    pub fn with_capacity(
        device_type: DeviceType,
        device_id: u32,
        capacity: usize,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            device_type,
            device_id,
            allocator: Arc::new(SimulatedAllocator::new(device_type, device_id, capacity)),
            shutdown,
        }
    }

    /// The device allocator.
    pub fn device_allocator(&self) -> &Arc<SimulatedAllocator> {
        &self.allocator
    }
}

impl DeviceContext for SimulatedDeviceContext {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn allocator(&self) -> Option<Arc<dyn Allocator>> {
        Some(Arc::clone(&self.allocator) as Arc<dyn Allocator>)
    }

    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

impl std::fmt::Debug for SimulatedDeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDeviceContext")
            .field("device", &self.device_type)
            .field("device_id", &self.device_id)
            .field("allocated", &self.allocator.allocated_bytes())
            .field("capacity", &self.allocator.capacity())
            .finish()
    }
}
