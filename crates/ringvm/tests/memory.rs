//! Tensor body allocation and release.

mod common;

use std::sync::Arc;

use common::*;
use ringvm::prelude::*;

#[test]
fn test_allocation_is_idempotent() {
    let runtime = CpuRuntime::new(ShutdownFlag::new());
    let ctx = runtime.device_context(DeviceType::Cuda, 0);
    let blob = EagerBlobObject::with_new_storage(
        MemoryCase::device(DeviceType::Cuda, 0),
        Shape::from([100]),
        DataType::Float32,
    );

    blob.try_allocate_body(ctx.as_ref()).unwrap();
    let first = blob.dptr();
    blob.try_allocate_body(ctx.as_ref()).unwrap();
    assert_eq!(blob.dptr(), first);
    assert_eq!(runtime.metrics().device_memory_used, BLOB_BODY_ALIGNMENT);

    blob.set_shape(Shape::from([1000]));
    assert_eq!(
        blob.try_allocate_body(ctx.as_ref()),
        Err(VmError::InsufficientStorage {
            required: 4000,
            allocated: BLOB_BODY_ALIGNMENT,
        })
    );
}

#[test]
fn test_pinning_only_on_host() {
    let runtime = CpuRuntime::new(ShutdownFlag::new());

    let pinned = EagerBlobObject::with_new_storage(MemoryCase::host(), Shape::from([8]), DataType::Float32)
        .with_pin_memory(true);
    pinned.try_allocate_body(runtime.host().as_ref()).unwrap();
    assert!(pinned.tensor_storage().is_pinned());

    for device in DeviceType::ALL.into_iter().filter(|d| d.is_accelerator()) {
        let on_device = EagerBlobObject::with_new_storage(
            MemoryCase::device(device, 0),
            Shape::from([8]),
            DataType::Float32,
        )
        .with_pin_memory(true);
        assert_eq!(
            on_device.try_allocate_body(runtime.host().as_ref()),
            Err(VmError::PinMemoryUnsupported { device })
        );

        let host_blob = EagerBlobObject::with_new_storage(MemoryCase::host(), Shape::from([8]), DataType::Float32)
            .with_pin_memory(true);
        let ctx = runtime.device_context(device, 0);
        assert_eq!(
            host_blob.try_allocate_body(ctx.as_ref()),
            Err(VmError::PinMemoryUnsupported { device })
        );
        assert!(!host_blob.tensor_storage().is_allocated());
    }
}

#[test]
fn test_release_tensor_frees_device_memory() {
    let gpu = StreamDesc::compute(DeviceType::Cuda, 0);
    let mut vm = RingVm::builder().stream(gpu).build().unwrap();
    let x = device_vector(&mut vm, DeviceType::Cuda, 256);

    vm.engine_mut().submit(fill(gpu, &x, 1.0)).unwrap();
    vm.engine_mut().barrier().unwrap();
    assert_eq!(vm.runtime().metrics().device_memory_used, 1024);

    let before = vm.engine().stats().scheduler.instructions_admitted;
    vm.engine_mut().release_tensor(x.object_id(), gpu).unwrap();
    // Accelerator compute streams need a soft sync ahead of the release.
    assert_eq!(vm.engine().stats().scheduler.instructions_admitted, before + 2);
    vm.engine_mut().barrier().unwrap();

    assert!(!x.tensor_storage().is_allocated());
    assert_eq!(vm.runtime().metrics().device_memory_used, 0);
    vm.shutdown().unwrap();
}

#[test]
fn test_release_tensor_on_cpu_skips_soft_sync() {
    let cpu = StreamDesc::compute(DeviceType::Cpu, 0);
    let mut vm = RingVm::builder().stream(cpu).build().unwrap();
    let x = host_vector(&mut vm, 16);

    vm.engine_mut().submit(fill(cpu, &x, 1.0)).unwrap();
    let before = vm.engine().stats().scheduler.instructions_admitted;
    vm.engine_mut().release_tensor(x.object_id(), cpu).unwrap();
    assert_eq!(vm.engine().stats().scheduler.instructions_admitted, before + 1);
    vm.engine_mut().barrier().unwrap();
    assert!(!x.tensor_storage().is_allocated());
    vm.shutdown().unwrap();
}

#[test]
fn test_release_tensor_rejects_unsupported_streams() {
    let mut vm = RingVm::builder().mode(ExecutionMode::Inline).build().unwrap();
    let x = host_vector(&mut vm, 4);

    let h2d_on_cpu = StreamDesc::new(StreamRole::Host2Device, DeviceType::Cpu, 0);
    assert_eq!(
        vm.engine_mut().release_tensor(x.object_id(), h2d_on_cpu),
        Err(VmError::RoleDeviceMismatch {
            role: StreamRole::Host2Device,
            device: DeviceType::Cpu,
        })
    );

    let critical = StreamDesc::new(StreamRole::CriticalSection, DeviceType::Cuda, 0);
    assert!(matches!(
        vm.engine_mut().release_tensor(x.object_id(), critical),
        Err(VmError::Unimplemented(_))
    ));
}

#[test]
fn test_shutdown_leaves_bodies_to_the_process() {
    let gpu = StreamDesc::compute(DeviceType::Cuda, 0);
    let mut vm = RingVm::builder().stream(gpu).build().unwrap();
    let x = device_vector(&mut vm, DeviceType::Cuda, 128);
    vm.engine_mut().submit(fill(gpu, &x, 1.0)).unwrap();
    vm.engine_mut().barrier().unwrap();
    assert_eq!(vm.runtime().metrics().device_memory_used, 512);

    vm.engine_mut().shutdown().unwrap();
    assert!(vm.engine().shutdown_flag().is_shutting_down());
    assert_eq!(Arc::strong_count(&x), 1);
    drop(x);
    assert_eq!(vm.runtime().metrics().device_memory_used, 512);
}
