//! Kernel catalog interface.
//!
//! The engine does not know what an opcode computes. Executors look the
//! opcode up in a [`KernelRegistry`] and hand the kernel a
//! [`KernelContext`] with the instruction's operands resolved.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, VmError};
use crate::instruction::Instruction;
use crate::memory::DeviceContext;
use crate::message::{InstructionMsg, Operand, SOFT_SYNC_OPCODE};
use crate::object::EagerBlobObject;
use crate::stream_role::{StreamDesc, StreamRole};
use crate::types::DeviceType;

/// Owned snapshot of an instruction, ready to run on an executor thread.
#[derive(Debug, Clone)]
pub struct InstructionTask {
    msg: InstructionMsg,
    objects: Vec<Option<Arc<EagerBlobObject>>>,
}

impl InstructionTask {
    /// Task with explicitly resolved operand objects, one slot per operand.
    pub fn new(msg: InstructionMsg, objects: Vec<Option<Arc<EagerBlobObject>>>) -> Self {
        Self { msg, objects }
    }

    /// Snapshot a scheduled instruction.
    pub fn from_instruction(instruction: &Instruction) -> Self {
        let objects = (0..instruction.msg().operands().len())
            .map(|i| instruction.operand_object(i).cloned())
            .collect();
        Self {
            msg: instruction.msg().clone(),
            objects,
        }
    }

    /// The instruction message.
    pub fn msg(&self) -> &InstructionMsg {
        &self.msg
    }

    /// Opcode.
    pub fn opcode(&self) -> &str {
        self.msg.opcode()
    }
}

/// Everything a kernel may touch while it runs.
pub struct KernelContext<'a> {
    task: &'a InstructionTask,
    device: &'a dyn DeviceContext,
    stream: StreamDesc,
}

impl<'a> KernelContext<'a> {
    /// Create a context.
    pub fn new(task: &'a InstructionTask, device: &'a dyn DeviceContext, stream: StreamDesc) -> Self {
        Self {
            task,
            device,
            stream,
        }
    }

    /// Stream the instruction runs on.
    pub fn stream(&self) -> StreamDesc {
        self.stream
    }

    /// Device context.
    pub fn device(&self) -> &dyn DeviceContext {
        self.device
    }

    /// Number of operands.
    pub fn num_operands(&self) -> usize {
        self.task.msg.operands().len()
    }

    /// Raw operand.
    pub fn operand(&self, index: usize) -> Result<Operand> {
        self.task
            .msg
            .operands()
            .get(index)
            .copied()
            .ok_or_else(|| VmError::InvalidConfig(format!("operand {} out of range", index)))
    }

    /// Object behind an object operand.
    pub fn object(&self, index: usize) -> Result<&Arc<EagerBlobObject>> {
        self.task
            .objects
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| VmError::InvalidConfig(format!("operand {} is not an object", index)))
    }

    /// Signed immediate operand.
    pub fn i64(&self, index: usize) -> Result<i64> {
        match self.operand(index)? {
            Operand::Int64(v) => Ok(v),
            other => Err(VmError::InvalidConfig(format!(
                "operand {} is {:?}, expected Int64",
                index, other
            ))),
        }
    }

    /// Floating point immediate operand.
    pub fn f64(&self, index: usize) -> Result<f64> {
        match self.operand(index)? {
            Operand::Double(v) => Ok(v),
            other => Err(VmError::InvalidConfig(format!(
                "operand {} is {:?}, expected Double",
                index, other
            ))),
        }
    }

    /// Allocate the body of an output operand if needed.
    pub fn allocate_output(&self, index: usize) -> Result<&Arc<EagerBlobObject>> {
        let object = self.object(index)?;
        object.try_allocate_body(self.device)?;
        Ok(object)
    }
}

/// Computes one opcode.
pub trait InstructionKernel: Send + Sync {
    /// Run the kernel.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

impl<F> InstructionKernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync,
{
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Soft sync: ordering is carried by the scheduler edge, nothing to compute.
struct SoftSyncKernel;

impl InstructionKernel for SoftSyncKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        trace!(stream = %ctx.stream(), "soft sync");
        Ok(())
    }
}

/// Drops the body of every object operand.
struct ReleaseTensorKernel;

impl InstructionKernel for ReleaseTensorKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        for index in 0..ctx.num_operands() {
            if let Ok(object) = ctx.object(index) {
                let released = object.tensor_storage().release();
                trace!(object = %object.object_id(), released, "release tensor");
            }
        }
        Ok(())
    }
}

/// Opcode to kernel lookup.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn InstructionKernel>>,
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with soft sync and every release instruction.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SOFT_SYNC_OPCODE, SoftSyncKernel);
        let release: Arc<dyn InstructionKernel> = Arc::new(ReleaseTensorKernel);
        for role in StreamRole::SCHEDULABLE {
            for device in DeviceType::ALL {
                if let Ok(name) = role.release_instruction_name(device) {
                    registry
                        .kernels
                        .insert(name.into_owned(), Arc::clone(&release));
                }
            }
        }
        registry
    }

    /// Register a kernel for an opcode, replacing any previous one.
    pub fn register(&mut self, opcode: impl Into<String>, kernel: impl InstructionKernel + 'static) {
        self.kernels.insert(opcode.into(), Arc::new(kernel));
    }

    /// Look up a kernel.
    pub fn get(&self, opcode: &str) -> Result<Arc<dyn InstructionKernel>> {
        self.kernels
            .get(opcode)
            .cloned()
            .ok_or_else(|| VmError::KernelNotFound(opcode.to_string()))
    }

    /// Whether an opcode is registered.
    pub fn contains(&self, opcode: &str) -> bool {
        self.kernels.contains_key(opcode)
    }

    /// Number of registered opcodes.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Run one instruction task.
    pub fn run(&self, task: &InstructionTask, device: &dyn DeviceContext, stream: StreamDesc) -> Result<()> {
        let kernel = self.get(task.opcode())?;
        let mut ctx = KernelContext::new(task, device, stream);
        kernel.compute(&mut ctx)
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.kernels.keys().collect();
        opcodes.sort();
        f.debug_struct("KernelRegistry")
            .field("opcodes", &opcodes)
            .finish()
    }
}
