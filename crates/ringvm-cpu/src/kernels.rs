//! Host kernels for simple tensor instructions.
//!
//! Operand layouts:
//! - `fill`: `Mut(out)`, `Double(value)`
//! - `copy`: `Const(src)`, `Mut(dst)`
//! - `add`: `Const(lhs)`, `Const(rhs)`, `Mut(out)`
//!
//! `fill` and `add` support `Float32` and `Float64`. `copy` moves raw bytes
//! and serves both host-to-device and device-to-host streams.

use bytemuck::Pod;
use tracing::trace;

use ringvm_core::error::{Result, VmError};
use ringvm_core::kernel::{KernelContext, KernelRegistry};
use ringvm_core::object::EagerBlobObject;
use ringvm_core::types::DataType;

/// Opcode of the fill kernel.
pub const FILL_OPCODE: &str = "fill";
/// Opcode of the byte copy kernel.
pub const COPY_OPCODE: &str = "copy";
/// Opcode of the elementwise add kernel.
pub const ADD_OPCODE: &str = "add";

/// Register the host kernels.
pub fn register_host_kernels(registry: &mut KernelRegistry) {
    registry.register(FILL_OPCODE, fill);
    registry.register(COPY_OPCODE, copy);
    registry.register(ADD_OPCODE, add);
}

/// Registry with the builtins and the host kernels.
pub fn host_registry() -> KernelRegistry {
    let mut registry = KernelRegistry::with_builtins();
    register_host_kernels(&mut registry);
    registry
}

fn body_offset(object: &EagerBlobObject) -> usize {
    object.storage_offset() * object.data_type().size_of()
}

fn missing_body(object: &EagerBlobObject) -> VmError {
    VmError::InvalidState {
        expected: format!("allocated body for {}", object.object_id()),
        actual: "no body".to_string(),
    }
}

/// Copy the body of `object` out as raw bytes.
pub fn read_bytes(object: &EagerBlobObject) -> Result<Vec<u8>> {
    let mut out = vec![0u8; object.byte_size_of_body()?];
    object
        .tensor_storage()
        .with_buffer(|buffer| buffer.copy_to_host(body_offset(object), &mut out))
        .ok_or_else(|| missing_body(object))??;
    Ok(out)
}

/// Overwrite the body of `object` with `data`.
pub fn write_bytes(object: &EagerBlobObject, data: &[u8]) -> Result<()> {
    object
        .tensor_storage()
        .with_buffer_mut(|buffer| buffer.copy_from_host(body_offset(object), data))
        .ok_or_else(|| missing_body(object))?
}

/// Read the body of `object` as elements of `T`.
pub fn read_elements<T: Pod>(object: &EagerBlobObject) -> Result<Vec<T>> {
    check_element_size::<T>(object)?;
    let mut out = vec![T::zeroed(); object.shape().elem_cnt()];
    object
        .tensor_storage()
        .with_buffer(|buffer| buffer.copy_to_host(body_offset(object), bytemuck::cast_slice_mut(&mut out)))
        .ok_or_else(|| missing_body(object))??;
    Ok(out)
}

/// Write `values` into the body of `object`.
pub fn write_elements<T: Pod>(object: &EagerBlobObject, values: &[T]) -> Result<()> {
    check_element_size::<T>(object)?;
    write_bytes(object, bytemuck::cast_slice(values))
}

fn check_element_size<T>(object: &EagerBlobObject) -> Result<()> {
    if std::mem::size_of::<T>() != object.data_type().size_of() {
        return Err(VmError::InvalidConfig(format!(
            "element size {} does not match {:?}",
            std::mem::size_of::<T>(),
            object.data_type()
        )));
    }
    Ok(())
}

fn unsupported(opcode: &str, data_type: DataType) -> VmError {
    VmError::Unimplemented(format!("{} for {:?}", opcode, data_type))
}

fn fill(ctx: &mut KernelContext<'_>) -> Result<()> {
    let value = ctx.f64(1)?;
    let out = ctx.allocate_output(0)?;
    let count = out.shape().elem_cnt();
    match out.data_type() {
        DataType::Float32 => write_elements(out, &vec![value as f32; count])?,
        DataType::Float64 => write_elements(out, &vec![value; count])?,
        other => return Err(unsupported(FILL_OPCODE, other)),
    }
    trace!(object = %out.object_id(), value, count, "fill");
    Ok(())
}

fn copy(ctx: &mut KernelContext<'_>) -> Result<()> {
    let src = ctx.object(0)?;
    let dst = ctx.allocate_output(1)?;
    let (src_bytes, dst_bytes) = (src.byte_size_of_body()?, dst.byte_size_of_body()?);
    if src_bytes != dst_bytes {
        return Err(VmError::InvalidConfig(format!(
            "copy size mismatch: {} bytes into {} bytes",
            src_bytes, dst_bytes
        )));
    }
    let bytes = read_bytes(src)?;
    write_bytes(dst, &bytes)?;
    trace!(src = %src.object_id(), dst = %dst.object_id(), bytes = bytes.len(), "copy");
    Ok(())
}

fn add(ctx: &mut KernelContext<'_>) -> Result<()> {
    let lhs = ctx.object(0)?;
    let rhs = ctx.object(1)?;
    let out = ctx.allocate_output(2)?;
    if lhs.shape() != rhs.shape() || lhs.shape() != out.shape() {
        return Err(VmError::InvalidConfig(format!(
            "add shape mismatch: {:?} + {:?} -> {:?}",
            lhs.shape(),
            rhs.shape(),
            out.shape()
        )));
    }
    match out.data_type() {
        DataType::Float32 => add_typed::<f32>(lhs, rhs, out),
        DataType::Float64 => add_typed::<f64>(lhs, rhs, out),
        other => Err(unsupported(ADD_OPCODE, other)),
    }
}

fn add_typed<T>(lhs: &EagerBlobObject, rhs: &EagerBlobObject, out: &EagerBlobObject) -> Result<()>
where
    T: Pod + std::ops::Add<Output = T>,
{
    let a = read_elements::<T>(lhs)?;
    let b = read_elements::<T>(rhs)?;
    let sum: Vec<T> = a.iter().zip(&b).map(|(x, y)| *x + *y).collect();
    write_elements(out, &sum)
}
