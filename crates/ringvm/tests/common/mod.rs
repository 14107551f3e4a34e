//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringvm::prelude::*;

/// Opcode of a fill that blocks until its gate opens.
pub const GATED_FILL: &str = "gated_fill";

/// One-shot gate a kernel can block on.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (open, cond) = &*self.0;
        *open.lock() = true;
        cond.notify_all();
    }

    pub fn wait(&self) {
        let (open, cond) = &*self.0;
        let mut guard = open.lock();
        while !*guard {
            if cond.wait_for(&mut guard, Duration::from_secs(10)).timed_out() {
                panic!("gate never opened");
            }
        }
    }
}

/// Host kernels plus [`GATED_FILL`] bound to `gate`.
pub fn gated_registry(gate: &Gate) -> KernelRegistry {
    let mut registry = host_registry();
    let gate = gate.clone();
    registry.register(GATED_FILL, move |ctx: &mut KernelContext<'_>| {
        gate.wait();
        let value = ctx.f64(1)? as f32;
        let out = ctx.allocate_output(0)?;
        write_elements(out, &vec![value; out.shape().elem_cnt()])
    });
    registry
}

pub fn fill(desc: StreamDesc, object: &EagerBlobObject, value: f64) -> InstructionMsg {
    InstructionMsg::builder(desc, "fill")
        .write(object.object_id())
        .operand(Operand::Double(value))
        .build()
        .expect("fill message")
}

pub fn gated_fill(desc: StreamDesc, object: &EagerBlobObject, value: f64) -> InstructionMsg {
    InstructionMsg::builder(desc, GATED_FILL)
        .write(object.object_id())
        .operand(Operand::Double(value))
        .build()
        .expect("gated fill message")
}

pub fn add(desc: StreamDesc, lhs: &EagerBlobObject, rhs: &EagerBlobObject, out: &EagerBlobObject) -> InstructionMsg {
    InstructionMsg::builder(desc, "add")
        .read(lhs.object_id())
        .read(rhs.object_id())
        .write(out.object_id())
        .build()
        .expect("add message")
}

pub fn copy(desc: StreamDesc, src: &EagerBlobObject, dst: &EagerBlobObject) -> InstructionMsg {
    InstructionMsg::builder(desc, "copy")
        .read(src.object_id())
        .write(dst.object_id())
        .build()
        .expect("copy message")
}

pub fn host_vector(vm: &mut RingVm, len: usize) -> Arc<EagerBlobObject> {
    vm.engine_mut()
        .new_object(MemoryCase::host(), Shape::from([len]), DataType::Float32)
}

pub fn device_vector(vm: &mut RingVm, device: DeviceType, len: usize) -> Arc<EagerBlobObject> {
    vm.engine_mut()
        .new_object(MemoryCase::device(device, 0), Shape::from([len]), DataType::Float32)
}
