//! Register/storage objects.
//!
//! An [`EagerBlobObject`] owns the memory of one tensor. The body buffer
//! lives in a shared [`TensorStorage`] and is allocated lazily the first
//! time an instruction needs it. The scheduler never looks at the memory
//! itself; it orders accesses through the object's [`DepObject`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{Result, VmError};
use crate::memory::{align, Allocator, BlobBuffer, DeviceContext, ShutdownFlag, BLOB_BODY_ALIGNMENT};
use crate::types::{DataType, DeviceType, MemoryCase, ObjectId, Shape};

/// An allocated body buffer together with the allocator that must free it.
///
/// Dropping the body returns the buffer to its allocator unless the engine
/// is shutting down, in which case the buffer is leaked.
pub struct BlobBody {
    buffer: Option<Box<dyn BlobBuffer>>,
    allocator: Arc<dyn Allocator>,
    shutdown: ShutdownFlag,
}

impl BlobBody {
    fn new(buffer: Box<dyn BlobBuffer>, allocator: Arc<dyn Allocator>, shutdown: ShutdownFlag) -> Self {
        Self {
            buffer: Some(buffer),
            allocator,
            shutdown,
        }
    }

    /// Address of the buffer.
    pub fn dptr(&self) -> usize {
        self.buffer.as_ref().map(|b| b.device_ptr()).unwrap_or(0)
    }

    /// Size of the buffer in bytes.
    pub fn bytes(&self) -> usize {
        self.buffer.as_ref().map(|b| b.size()).unwrap_or(0)
    }

    /// Whether the buffer is pinned host memory.
    pub fn is_pinned(&self) -> bool {
        self.buffer.as_ref().map(|b| b.is_pinned()).unwrap_or(false)
    }
}

impl Drop for BlobBody {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        if self.shutdown.is_shutting_down() {
            trace!(bytes = buffer.size(), "skipping body deallocation during shutdown");
            std::mem::forget(buffer);
            return;
        }
        self.allocator.deallocate(buffer);
    }
}

/// Shared owner of a tensor body.
///
/// Several blob objects may view the same storage at different offsets.
#[derive(Default)]
pub struct TensorStorage {
    body: Mutex<Option<BlobBody>>,
}

impl TensorStorage {
    /// Create an empty storage.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Address of the body, if allocated.
    pub fn blob_dptr(&self) -> Option<usize> {
        self.body.lock().as_ref().map(|b| b.dptr())
    }

    /// Size of the body in bytes, zero if not allocated.
    pub fn blob_bytes(&self) -> usize {
        self.body.lock().as_ref().map(|b| b.bytes()).unwrap_or(0)
    }

    /// Whether a body has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.body.lock().is_some()
    }

    /// Whether the body is pinned host memory.
    pub fn is_pinned(&self) -> bool {
        self.body.lock().as_ref().map(|b| b.is_pinned()).unwrap_or(false)
    }

    /// Drop the body. Returns true if there was one.
    pub fn release(&self) -> bool {
        let body = self.body.lock().take();
        body.is_some()
    }

    /// Run `f` against the body buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&dyn BlobBuffer) -> R) -> Option<R> {
        let body = self.body.lock();
        body.as_ref()
            .and_then(|b| b.buffer.as_deref())
            .map(|buffer| f(buffer))
    }

    /// Run `f` against the body buffer mutably.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut dyn BlobBuffer) -> R) -> Option<R> {
        let mut body = self.body.lock();
        body.as_mut()
            .and_then(|b| b.buffer.as_deref_mut())
            .map(|buffer| f(buffer))
    }
}

impl std::fmt::Debug for TensorStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorStorage")
            .field("dptr", &self.blob_dptr())
            .field("bytes", &self.blob_bytes())
            .finish()
    }
}

/// Dependency token the scheduler orders accesses on.
#[derive(Debug)]
pub struct DepObject {
    id: ObjectId,
}

impl DepObject {
    /// Create a token with a fresh id.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::generate(),
        })
    }

    /// Identity used for access tracking.
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

/// Owner of one tensor's memory.
pub struct EagerBlobObject {
    mem_case: MemoryCase,
    data_type: DataType,
    shape: RwLock<Shape>,
    storage_offset: AtomicUsize,
    is_dynamic: AtomicBool,
    is_shape_synced: AtomicBool,
    pin_memory: bool,
    tensor_storage: Arc<TensorStorage>,
    dep_object: Arc<DepObject>,
}

impl EagerBlobObject {
    /// Create a blob object over an existing storage and dependency token.
    pub fn new(
        mem_case: MemoryCase,
        shape: Shape,
        data_type: DataType,
        tensor_storage: Arc<TensorStorage>,
        dep_object: Arc<DepObject>,
    ) -> Self {
        Self {
            mem_case,
            data_type,
            shape: RwLock::new(shape),
            storage_offset: AtomicUsize::new(0),
            is_dynamic: AtomicBool::new(false),
            is_shape_synced: AtomicBool::new(true),
            pin_memory: false,
            tensor_storage,
            dep_object,
        }
    }

    /// Create a blob object with its own empty storage.
    pub fn with_new_storage(mem_case: MemoryCase, shape: Shape, data_type: DataType) -> Self {
        Self::new(mem_case, shape, data_type, TensorStorage::new(), DepObject::new())
    }

    /// Request that the body be allocated from pinned host memory.
    pub fn with_pin_memory(mut self, pin_memory: bool) -> Self {
        self.pin_memory = pin_memory;
        self
    }

    /// Scheduler identity of this object.
    pub fn object_id(&self) -> ObjectId {
        self.dep_object.id()
    }

    /// Dependency token.
    pub fn dep_object(&self) -> &Arc<DepObject> {
        &self.dep_object
    }

    /// Memory placement.
    pub fn mem_case(&self) -> MemoryCase {
        self.mem_case
    }

    /// Element type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Current shape.
    pub fn shape(&self) -> Shape {
        self.shape.read().clone()
    }

    /// Replace the shape. Marks the shape as unsynced for dynamic blobs.
    pub fn set_shape(&self, shape: Shape) {
        *self.shape.write() = shape;
        if self.is_dynamic() {
            self.set_is_shape_synced(false);
        }
    }

    /// Whether the shape may change between runs.
    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic.load(Ordering::Acquire)
    }

    /// Mark the shape as dynamic.
    pub fn set_is_dynamic(&self, is_dynamic: bool) {
        self.is_dynamic.store(is_dynamic, Ordering::Release);
    }

    /// Whether asynchronous producers have published the final shape.
    pub fn is_shape_synced(&self) -> bool {
        self.is_shape_synced.load(Ordering::Acquire)
    }

    /// Set the shape-synced flag.
    pub fn set_is_shape_synced(&self, synced: bool) {
        self.is_shape_synced.store(synced, Ordering::Release);
    }

    /// Offset into the storage, in elements.
    pub fn storage_offset(&self) -> usize {
        self.storage_offset.load(Ordering::Acquire)
    }

    /// Set the offset into the storage, in elements.
    pub fn set_storage_offset(&self, offset: usize) {
        self.storage_offset.store(offset, Ordering::Release);
    }

    /// Whether the body should come from pinned memory.
    pub fn pin_memory(&self) -> bool {
        self.pin_memory
    }

    /// Shared storage handle.
    pub fn tensor_storage(&self) -> &Arc<TensorStorage> {
        &self.tensor_storage
    }

    /// Bytes the body needs for the current shape and dtype.
    pub fn byte_size_of_body(&self) -> Result<usize> {
        let shape = self.shape.read();
        shape
            .checked_elem_cnt()
            .and_then(|count| count.checked_mul(self.data_type.size_of()))
            .ok_or_else(|| {
                VmError::InvalidConfig(format!(
                    "body of {:?} x {:?} overflows usize",
                    shape.dims(),
                    self.data_type
                ))
            })
    }

    /// Body size rounded up to the allocation alignment.
    pub fn aligned_byte_size_of_body(&self) -> Result<usize> {
        let bytes = self.byte_size_of_body()?;
        if bytes > usize::MAX - (BLOB_BODY_ALIGNMENT - 1) {
            return Err(VmError::InvalidConfig(format!(
                "body of {} bytes overflows when aligned",
                bytes
            )));
        }
        Ok(align::align_up(bytes, BLOB_BODY_ALIGNMENT))
    }

    /// Address of the first element of this view, if allocated.
    pub fn dptr(&self) -> Option<usize> {
        self.tensor_storage
            .blob_dptr()
            .map(|base| base + self.storage_offset() * self.data_type.size_of())
    }

    /// Allocate the body if it does not exist yet.
    ///
    /// Idempotent once the body is large enough. A body that exists but is
    /// smaller than required fails with [`VmError::InsufficientStorage`].
    pub fn try_allocate_body(&self, ctx: &dyn DeviceContext) -> Result<()> {
        let allocator = if self.pin_memory {
            if !self.mem_case.is_host() {
                return Err(VmError::PinMemoryUnsupported {
                    device: self.mem_case.device_type,
                });
            }
            if ctx.device_type() != DeviceType::Cpu {
                return Err(VmError::PinMemoryUnsupported {
                    device: ctx.device_type(),
                });
            }
            ctx.pin_memory_allocator().ok_or_else(|| {
                VmError::AllocatorUnavailable(
                    "create pin_memory allocator failed, the device runtime is not loaded"
                        .to_string(),
                )
            })?
        } else {
            ctx.allocator().ok_or_else(|| {
                VmError::AllocatorUnavailable(format!("no allocator for {}", ctx.device_type()))
            })?
        };

        let required = self.aligned_byte_size_of_body()?;
        let mut body = self.tensor_storage.body.lock();

        if required == 0 {
            if body.is_some() {
                return Err(VmError::InvalidState {
                    expected: "no body for zero-sized blob".to_string(),
                    actual: "body allocated".to_string(),
                });
            }
            return Ok(());
        }

        if let Some(existing) = body.as_ref() {
            let needed = self.byte_size_of_body()?;
            if existing.bytes() < needed {
                return Err(VmError::InsufficientStorage {
                    required: needed,
                    allocated: existing.bytes(),
                });
            }
            return Ok(());
        }

        let buffer = allocator.allocate(required)?;
        debug!(
            object = %self.object_id(),
            bytes = required,
            pinned = self.pin_memory,
            mem_case = %self.mem_case,
            "allocated blob body"
        );
        *body = Some(BlobBody::new(buffer, allocator, ctx.shutdown_flag().clone()));
        Ok(())
    }
}

impl std::fmt::Debug for EagerBlobObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagerBlobObject")
            .field("id", &self.object_id())
            .field("mem_case", &self.mem_case)
            .field("shape", &self.shape())
            .field("data_type", &self.data_type)
            .field("storage", &self.tensor_storage)
            .finish()
    }
}

/// Lookup from object id to live blob objects.
///
/// The registry holds weak references; instructions that touch an object
/// keep it alive through the strong handle they capture at admission.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<ObjectId, Weak<EagerBlobObject>>,
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blob object.
    pub fn insert(&mut self, object: &Arc<EagerBlobObject>) -> ObjectId {
        let id = object.object_id();
        self.objects.insert(id, Arc::downgrade(object));
        id
    }

    /// Look up a live object.
    pub fn get(&self, id: ObjectId) -> Option<Arc<EagerBlobObject>> {
        self.objects.get(&id).and_then(Weak::upgrade)
    }

    /// Look up an object that must exist.
    ///
    /// # Panics
    ///
    /// Panics if the object was never registered or has been destroyed.
    pub fn resolve(&self, id: ObjectId) -> Arc<EagerBlobObject> {
        match self.get(id) {
            Some(object) => object,
            None => {
                tracing::error!(object = %id, "dangling object access");
                panic!("dangling access to {id}: object is not registered or has been destroyed");
            }
        }
    }

    /// Forget an object.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.objects.remove(&id).is_some()
    }

    /// Drop entries whose objects have been destroyed.
    pub fn prune(&mut self) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, weak| weak.strong_count() > 0);
        before - self.objects.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostAllocator, HostDeviceContext};

    struct FakeDeviceContext {
        device: DeviceType,
        allocator: Arc<HostAllocator>,
        shutdown: ShutdownFlag,
    }

    impl DeviceContext for FakeDeviceContext {
        fn device_type(&self) -> DeviceType {
            self.device
        }

        fn allocator(&self) -> Option<Arc<dyn Allocator>> {
            Some(Arc::clone(&self.allocator) as Arc<dyn Allocator>)
        }

        fn shutdown_flag(&self) -> &ShutdownFlag {
            &self.shutdown
        }
    }

    fn host_blob(dims: &[usize]) -> EagerBlobObject {
        EagerBlobObject::with_new_storage(MemoryCase::host(), Shape::from(dims), DataType::Float32)
    }

    #[test]
    fn test_overflowing_body_rejected() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[usize::MAX / 2, 3]);
        assert!(matches!(blob.byte_size_of_body(), Err(VmError::InvalidConfig(_))));
        assert!(matches!(blob.try_allocate_body(&ctx), Err(VmError::InvalidConfig(_))));

        // Fits as elements, overflows once scaled by the dtype size.
        let blob = host_blob(&[usize::MAX / 2]);
        assert!(matches!(blob.byte_size_of_body(), Err(VmError::InvalidConfig(_))));
        assert!(blob.dptr().is_none());
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[4, 8]);

        blob.try_allocate_body(&ctx).unwrap();
        let ptr = blob.dptr();
        let bytes = blob.tensor_storage().blob_bytes();
        assert_eq!(bytes, 512);

        blob.try_allocate_body(&ctx).unwrap();
        assert_eq!(blob.dptr(), ptr);
        assert_eq!(blob.tensor_storage().blob_bytes(), bytes);
        assert_eq!(ctx.host_allocator().total_allocations(), 1);
    }

    #[test]
    fn test_undersized_storage_fails() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[16]);
        blob.try_allocate_body(&ctx).unwrap();

        blob.set_shape(Shape::from([1024]));
        let err = blob.try_allocate_body(&ctx).unwrap_err();
        assert_eq!(
            err,
            VmError::InsufficientStorage {
                required: 4096,
                allocated: 512
            }
        );
    }

    #[test]
    fn test_zero_sized_blob_is_noop() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[0, 3]);
        blob.try_allocate_body(&ctx).unwrap();
        assert!(!blob.tensor_storage().is_allocated());
        assert_eq!(ctx.host_allocator().total_allocations(), 0);
    }

    #[test]
    fn test_pinned_host_allocation() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[8]).with_pin_memory(true);
        blob.try_allocate_body(&ctx).unwrap();
        assert!(blob.tensor_storage().is_pinned());
        assert_eq!(ctx.host_allocator().total_allocations(), 0);
    }

    #[test]
    fn test_pin_memory_rejected_off_host() {
        for device in DeviceType::ALL.into_iter().filter(|d| d.is_accelerator()) {
            let ctx = FakeDeviceContext {
                device,
                allocator: Arc::new(HostAllocator::new()),
                shutdown: ShutdownFlag::new(),
            };
            let blob = EagerBlobObject::with_new_storage(
                MemoryCase::device(device, 0),
                Shape::from([8]),
                DataType::Float32,
            )
            .with_pin_memory(true);

            let err = blob.try_allocate_body(&ctx).unwrap_err();
            assert_eq!(err, VmError::PinMemoryUnsupported { device });
            assert!(!blob.tensor_storage().is_allocated());
        }
    }

    #[test]
    fn test_missing_pinned_allocator() {
        let ctx = HostDeviceContext::without_pinned(ShutdownFlag::new());
        let blob = host_blob(&[8]).with_pin_memory(true);
        let err = blob.try_allocate_body(&ctx).unwrap_err();
        assert!(matches!(err, VmError::AllocatorUnavailable(_)));
    }

    #[test]
    fn test_release_returns_memory() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[128]);
        blob.try_allocate_body(&ctx).unwrap();
        assert_eq!(ctx.host_allocator().allocated_bytes(), 512);

        assert!(blob.tensor_storage().release());
        assert_eq!(ctx.host_allocator().allocated_bytes(), 0);
    }

    #[test]
    fn test_release_suppressed_during_shutdown() {
        let shutdown = ShutdownFlag::new();
        let ctx = HostDeviceContext::new(shutdown.clone());
        let blob = host_blob(&[128]);
        blob.try_allocate_body(&ctx).unwrap();

        shutdown.set();
        assert!(blob.tensor_storage().release());
        assert_eq!(ctx.host_allocator().allocated_bytes(), 512);
    }

    #[test]
    fn test_storage_offset_dptr() {
        let ctx = HostDeviceContext::new(ShutdownFlag::new());
        let blob = host_blob(&[64]);
        blob.try_allocate_body(&ctx).unwrap();
        let base = blob.tensor_storage().blob_dptr().unwrap();

        blob.set_storage_offset(3);
        assert_eq!(blob.dptr(), Some(base + 12));
    }

    #[test]
    fn test_dynamic_shape_unsyncs() {
        let blob = host_blob(&[2]);
        blob.set_is_dynamic(true);
        assert!(blob.is_shape_synced());
        blob.set_shape(Shape::from([3]));
        assert!(!blob.is_shape_synced());
    }

    #[test]
    fn test_registry_weak_lookup() {
        let mut registry = ObjectRegistry::new();
        let blob = Arc::new(host_blob(&[1]));
        let id = registry.insert(&blob);
        assert!(registry.get(id).is_some());

        drop(blob);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.prune(), 1);
    }

    #[test]
    #[should_panic(expected = "dangling access")]
    fn test_registry_dangling_resolve_panics() {
        let registry = ObjectRegistry::new();
        registry.resolve(ObjectId(u64::MAX));
    }
}
