//! Instructions and their object access footprint.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::message::InstructionMsg;
use crate::object::{EagerBlobObject, ObjectRegistry};
use crate::types::{ChainId, ObjectId};

/// How an instruction touches an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessKind {
    /// Reads only.
    Read,
    /// Reads and/or writes.
    Write,
}

impl AccessKind {
    /// Whether two accesses to the same object must be ordered.
    #[inline]
    pub fn conflicts_with(self, other: AccessKind) -> bool {
        self == AccessKind::Write || other == AccessKind::Write
    }
}

/// One object access of an instruction.
#[derive(Debug, Clone)]
pub struct MirroredObjectAccess {
    object: Arc<EagerBlobObject>,
    kind: AccessKind,
}

impl MirroredObjectAccess {
    /// The accessed object.
    pub fn object(&self) -> &Arc<EagerBlobObject> {
        &self.object
    }

    /// Access kind.
    pub fn kind(&self) -> AccessKind {
        self.kind
    }
}

/// A scheduled instance of an instruction message.
///
/// Accesses are keyed by object id. An object that appears both as a read
/// and a write operand is recorded once, as a write.
#[derive(Debug)]
pub struct Instruction {
    msg: InstructionMsg,
    chain: ChainId,
    accesses: BTreeMap<ObjectId, MirroredObjectAccess>,
}

impl Instruction {
    /// Bind `msg` into an instruction owned by `chain`.
    ///
    /// # Panics
    ///
    /// Panics if an operand references an object that is not live.
    pub fn new(msg: InstructionMsg, chain: ChainId, registry: &ObjectRegistry) -> Self {
        let mut accesses: BTreeMap<ObjectId, MirroredObjectAccess> = BTreeMap::new();
        for operand in msg.operands() {
            let Some(id) = operand.object() else {
                continue;
            };
            let kind = if operand.is_mut() {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            accesses
                .entry(id)
                .and_modify(|access| access.kind = access.kind.max(kind))
                .or_insert_with(|| MirroredObjectAccess {
                    object: registry.resolve(id),
                    kind,
                });
        }

        Self {
            msg,
            chain,
            accesses,
        }
    }

    /// The originating message.
    pub fn msg(&self) -> &InstructionMsg {
        &self.msg
    }

    /// Owning chain.
    pub fn chain_id(&self) -> ChainId {
        self.chain
    }

    /// Access kind for `object`, if accessed.
    pub fn access(&self, object: ObjectId) -> Option<AccessKind> {
        self.accesses.get(&object).map(|a| a.kind)
    }

    /// Iterate accesses in object id order.
    pub fn accesses(&self) -> impl Iterator<Item = (ObjectId, &MirroredObjectAccess)> + '_ {
        self.accesses.iter().map(|(id, access)| (*id, access))
    }

    /// Object behind operand `index`, if that operand is an object operand.
    pub fn operand_object(&self, index: usize) -> Option<&Arc<EagerBlobObject>> {
        let id = self.msg.operands().get(index)?.object()?;
        self.accesses.get(&id).map(|a| &a.object)
    }

    /// Drop every access, releasing the object handles.
    pub fn release_accesses(&mut self) -> usize {
        let count = self.accesses.len();
        self.accesses.clear();
        count
    }
}
