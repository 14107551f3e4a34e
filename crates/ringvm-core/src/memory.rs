//! Host memory, allocators and device contexts.
//!
//! Tensor bodies are allocated through an [`Allocator`] obtained from a
//! [`DeviceContext`]. Host bodies may come from a pinned (page-locked)
//! allocator so that copy engines can DMA directly out of them.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, VmError};
use crate::types::DeviceType;

/// Alignment of every tensor body allocation.
pub const BLOB_BODY_ALIGNMENT: usize = 512;

/// A contiguous allocation holding a tensor body.
pub trait BlobBuffer: Send + Sync {
    /// Buffer size in bytes.
    fn size(&self) -> usize;

    /// Address of the first byte (as usize for FFI compatibility).
    fn device_ptr(&self) -> usize;

    /// Whether the buffer is page-locked host memory.
    fn is_pinned(&self) -> bool {
        false
    }

    /// Copy `data` into the buffer starting at `offset`.
    fn copy_from_host(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy bytes starting at `offset` into `data`.
    fn copy_to_host(&self, offset: usize, data: &mut [u8]) -> Result<()>;
}

/// Source of tensor body memory for one device.
pub trait Allocator: Send + Sync {
    /// Device this allocator serves.
    fn device_type(&self) -> DeviceType;

    /// Allocate `size` bytes aligned to [`BLOB_BODY_ALIGNMENT`].
    fn allocate(&self, size: usize) -> Result<Box<dyn BlobBuffer>>;

    /// Return a buffer previously handed out by [`Allocator::allocate`].
    fn deallocate(&self, buffer: Box<dyn BlobBuffer>);

    /// Bytes currently handed out.
    fn allocated_bytes(&self) -> usize;
}

/// Engine-wide shutdown flag.
///
/// Once set, tensor bodies dropped afterwards are leaked instead of being
/// returned to allocators that may already be torn down.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the engine as shutting down.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution context an instruction runs in.
pub trait DeviceContext: Send + Sync {
    /// Device kind of this context.
    fn device_type(&self) -> DeviceType;

    /// Device ordinal.
    fn device_id(&self) -> u32 {
        0
    }

    /// Regular allocator for the device, if any.
    fn allocator(&self) -> Option<Arc<dyn Allocator>>;

    /// Pinned host allocator. Only host contexts may provide one.
    fn pin_memory_allocator(&self) -> Option<Arc<dyn Allocator>> {
        None
    }

    /// Shutdown flag guarding deallocation.
    fn shutdown_flag(&self) -> &ShutdownFlag;
}

/// Zero-initialized, aligned host memory.
///
/// The pinned variant models page-locked memory used for DMA transfers.
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    pinned: bool,
}

impl HostMemory {
    /// Allocate `len` bytes aligned to `alignment`.
    pub fn new(len: usize, alignment: usize, pinned: bool) -> Result<Self> {
        if len == 0 {
            return Err(VmError::InvalidConfig(
                "Cannot allocate zero-sized buffer".to_string(),
            ));
        }

        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            VmError::AllocationFailed {
                size: len,
                device: DeviceType::Cpu,
            }
        })?;

        // In production the pinned variant would come from the driver
        // (cuMemAllocHost or mlock).
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };

        let ptr = NonNull::new(ptr).ok_or(VmError::AllocationFailed {
            size: len,
            device: DeviceType::Cpu,
        })?;

        Ok(Self {
            ptr,
            len,
            layout,
            pinned,
        })
    }

    /// Byte slice view.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable byte slice view.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with self.layout in HostMemory::new.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: HostMemory exclusively owns its allocation.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VmError::InvalidConfig(format!(
            "range {}..{} out of bounds for buffer of {} bytes",
            offset,
            offset.saturating_add(len),
            size
        ))),
    }
}

impl BlobBuffer for HostMemory {
    fn size(&self) -> usize {
        self.len
    }

    fn device_ptr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn is_pinned(&self) -> bool {
        self.pinned
    }

    fn copy_from_host(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.len)?;
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_to_host(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        check_range(offset, data.len(), self.len)?;
        data.copy_from_slice(&self.as_slice()[offset..offset + data.len()]);
        Ok(())
    }
}

/// Host allocator, optionally handing out pinned memory.
#[derive(Debug, Default)]
pub struct HostAllocator {
    pinned: bool,
    allocated: AtomicUsize,
    total_allocations: AtomicUsize,
}

impl HostAllocator {
    /// Pageable host allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pinned host allocator.
    pub fn pinned() -> Self {
        Self {
            pinned: true,
            ..Self::default()
        }
    }

    /// Whether buffers are pinned.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Number of successful allocations since creation.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }
}

impl Allocator for HostAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocate(&self, size: usize) -> Result<Box<dyn BlobBuffer>> {
        let mem = HostMemory::new(size, BLOB_BODY_ALIGNMENT, self.pinned)?;
        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(mem))
    }

    fn deallocate(&self, buffer: Box<dyn BlobBuffer>) {
        self.allocated.fetch_sub(buffer.size(), Ordering::Relaxed);
        drop(buffer);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Host execution context.
pub struct HostDeviceContext {
    allocator: Arc<HostAllocator>,
    pin_allocator: Option<Arc<HostAllocator>>,
    shutdown: ShutdownFlag,
}

impl HostDeviceContext {
    /// Host context with both a pageable and a pinned allocator.
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self {
            allocator: Arc::new(HostAllocator::new()),
            pin_allocator: Some(Arc::new(HostAllocator::pinned())),
            shutdown,
        }
    }

    /// Host context whose pinned allocator could not be created.
    pub fn without_pinned(shutdown: ShutdownFlag) -> Self {
        Self {
            allocator: Arc::new(HostAllocator::new()),
            pin_allocator: None,
            shutdown,
        }
    }

    /// Pageable allocator.
    pub fn host_allocator(&self) -> &Arc<HostAllocator> {
        &self.allocator
    }

    /// Pinned allocator, if available.
    pub fn pinned_allocator(&self) -> Option<&Arc<HostAllocator>> {
        self.pin_allocator.as_ref()
    }
}

impl DeviceContext for HostDeviceContext {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocator(&self) -> Option<Arc<dyn Allocator>> {
        Some(Arc::clone(&self.allocator) as Arc<dyn Allocator>)
    }

    fn pin_memory_allocator(&self) -> Option<Arc<dyn Allocator>> {
        self.pin_allocator
            .as_ref()
            .map(|a| Arc::clone(a) as Arc<dyn Allocator>)
    }

    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

/// Alignment utilities.
pub mod align {
    /// Align a value up to the next multiple of alignment.
    #[inline]
    pub const fn align_up(value: usize, alignment: usize) -> usize {
        let mask = alignment - 1;
        (value + mask) & !mask
    }

    /// Check if a value is aligned.
    #[inline]
    pub const fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }
}
