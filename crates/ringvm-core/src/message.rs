//! Instruction messages.
//!
//! An [`InstructionMsg`] is the immutable request a kernel catalog hands to
//! the engine: which stream type it targets, which opcode to run and which
//! objects it reads and writes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VmError};
use crate::stream_role::StreamDesc;
use crate::types::ObjectId;

/// Maximum number of operands per instruction.
pub const INSTRUCTION_OPERAND_LIMIT: usize = 64;

/// Opcode of the soft sync instruction.
pub const SOFT_SYNC_OPCODE: &str = "SoftSyncStream";

static INSTRUCTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Stable numeric identifier of an instruction message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub u64);

impl InstructionId {
    /// Allocate a process-unique instruction id.
    pub fn generate() -> Self {
        Self(INSTRUCTION_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instr#{}", self.0)
    }
}

/// Selects which stream instances of a stream type may run an instruction.
///
/// Bit `i` enables stream instance `i`. The scheduler picks the lowest
/// enabled instance that exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamMask(pub u64);

impl StreamMask {
    /// Any instance.
    pub const ALL: StreamMask = StreamMask(u64::MAX);

    /// Only instance `index`.
    pub fn only(index: usize) -> Self {
        debug_assert!(index < 64);
        StreamMask(1u64 << index)
    }

    /// Whether instance `index` is enabled.
    pub fn contains(&self, index: usize) -> bool {
        index < 64 && self.0 & (1u64 << index) != 0
    }

    /// Lowest enabled instance below `count`.
    pub fn first_enabled(&self, count: usize) -> Option<usize> {
        (0..count.min(64)).find(|i| self.contains(*i))
    }
}

impl Default for StreamMask {
    fn default() -> Self {
        StreamMask::ALL
    }
}

/// One operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Read-only access to an object.
    Const(ObjectId),
    /// Read-write access to an object.
    Mut(ObjectId),
    /// Signed immediate.
    Int64(i64),
    /// Unsigned immediate.
    UInt64(u64),
    /// Floating point immediate.
    Double(f64),
}

impl Operand {
    /// Object referenced by this operand, if any.
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            Operand::Const(id) | Operand::Mut(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this operand writes its object.
    pub fn is_mut(&self) -> bool {
        matches!(self, Operand::Mut(_))
    }
}

/// Immutable instruction request.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionMsg {
    id: InstructionId,
    stream_desc: StreamDesc,
    opcode: String,
    operands: Vec<Operand>,
    stream_mask: StreamMask,
}

impl InstructionMsg {
    /// Start building a message.
    pub fn builder(stream_desc: StreamDesc, opcode: impl Into<String>) -> InstructionMsgBuilder {
        InstructionMsgBuilder::new(stream_desc, opcode)
    }

    /// Soft sync instruction for `object` on the stream that produced it.
    pub fn soft_sync(stream_desc: StreamDesc, object: ObjectId) -> Self {
        Self {
            id: InstructionId::generate(),
            stream_desc,
            opcode: SOFT_SYNC_OPCODE.to_string(),
            operands: vec![Operand::Mut(object)],
            stream_mask: StreamMask::ALL,
        }
    }

    /// Message id.
    pub fn id(&self) -> InstructionId {
        self.id
    }

    /// Target stream type.
    pub fn stream_desc(&self) -> StreamDesc {
        self.stream_desc
    }

    /// Opcode.
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// Operands in order.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Stream instance mask.
    pub fn stream_mask(&self) -> StreamMask {
        self.stream_mask
    }

    /// Whether this is a soft sync instruction.
    pub fn is_soft_sync(&self) -> bool {
        self.opcode == SOFT_SYNC_OPCODE
    }
}

/// Builder for [`InstructionMsg`].
#[derive(Debug)]
pub struct InstructionMsgBuilder {
    id: Option<InstructionId>,
    stream_desc: StreamDesc,
    opcode: String,
    operands: Vec<Operand>,
    stream_mask: StreamMask,
}

impl InstructionMsgBuilder {
    /// Create a builder.
    pub fn new(stream_desc: StreamDesc, opcode: impl Into<String>) -> Self {
        Self {
            id: None,
            stream_desc,
            opcode: opcode.into(),
            operands: Vec::new(),
            stream_mask: StreamMask::ALL,
        }
    }

    /// Use an explicit id instead of a generated one.
    pub fn id(mut self, id: InstructionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Add a read operand.
    pub fn read(self, object: ObjectId) -> Self {
        self.operand(Operand::Const(object))
    }

    /// Add a write operand.
    pub fn write(self, object: ObjectId) -> Self {
        self.operand(Operand::Mut(object))
    }

    /// Add an operand.
    pub fn operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Restrict the stream instances.
    pub fn stream_mask(mut self, mask: StreamMask) -> Self {
        self.stream_mask = mask;
        self
    }

    /// Build the message.
    pub fn build(self) -> Result<InstructionMsg> {
        if self.operands.len() > INSTRUCTION_OPERAND_LIMIT {
            return Err(VmError::OperandLimitExceeded {
                limit: INSTRUCTION_OPERAND_LIMIT,
            });
        }
        Ok(InstructionMsg {
            id: self.id.unwrap_or_else(InstructionId::generate),
            stream_desc: self.stream_desc,
            opcode: self.opcode,
            operands: self.operands,
            stream_mask: self.stream_mask,
        })
    }
}
