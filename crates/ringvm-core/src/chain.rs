//! Instruction chains and their dependency edges.

use std::collections::BTreeSet;
use std::fmt;

use crate::instruction::Instruction;
use crate::types::{ChainId, StreamId};

/// Lifecycle state of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainState {
    /// Accepting instructions, waiting for in-edges or a stream slot.
    Pending,
    /// Handed to a stream inside a package.
    Dispatched,
    /// Package completion observed and every instruction ran.
    Done,
    /// An instruction failed, or a chain it waits on failed.
    Failed,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainState::Pending => f.write_str("pending"),
            ChainState::Dispatched => f.write_str("dispatched"),
            ChainState::Done => f.write_str("done"),
            ChainState::Failed => f.write_str("failed"),
        }
    }
}

/// Ordered instructions bound for one stream.
///
/// `in_edges` holds the chains that must complete before this one may be
/// dispatched; an entry is removed when its source completes. `out_edges`
/// holds the chains waiting on this one.
#[derive(Debug)]
pub struct InstrChain {
    id: ChainId,
    stream: StreamId,
    instructions: Vec<Instruction>,
    in_edges: BTreeSet<ChainId>,
    out_edges: BTreeSet<ChainId>,
    state: ChainState,
}

impl InstrChain {
    /// Create an empty chain for `stream`.
    pub fn new(id: ChainId, stream: StreamId) -> Self {
        Self {
            id,
            stream,
            instructions: Vec::new(),
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
            state: ChainState::Pending,
        }
    }

    /// Chain id.
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Target stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Instructions in admission order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Current state.
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Unresolved in-edges.
    pub fn in_edges(&self) -> &BTreeSet<ChainId> {
        &self.in_edges
    }

    /// Out-edges.
    pub fn out_edges(&self) -> &BTreeSet<ChainId> {
        &self.out_edges
    }

    /// Number of unresolved in-edges.
    pub fn unresolved_in_edges(&self) -> usize {
        self.in_edges.len()
    }

    /// Pending with every in-edge satisfied.
    pub fn is_ready(&self) -> bool {
        self.state == ChainState::Pending && self.in_edges.is_empty()
    }

    pub(crate) fn push_instruction(&mut self, instruction: Instruction) {
        debug_assert_eq!(instruction.chain_id(), self.id);
        self.instructions.push(instruction);
    }

    pub(crate) fn add_in_edge(&mut self, src: ChainId) -> bool {
        self.in_edges.insert(src)
    }

    pub(crate) fn add_out_edge(&mut self, dst: ChainId) -> bool {
        self.out_edges.insert(dst)
    }

    pub(crate) fn resolve_in_edge(&mut self, src: ChainId) -> bool {
        self.in_edges.remove(&src)
    }

    pub(crate) fn take_out_edges(&mut self) -> BTreeSet<ChainId> {
        std::mem::take(&mut self.out_edges)
    }

    pub(crate) fn set_state(&mut self, state: ChainState) {
        self.state = state;
    }

    pub(crate) fn release_instructions(&mut self) -> usize {
        self.instructions
            .iter_mut()
            .map(|instr| instr.release_accesses())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_idempotent() {
        let mut chain = InstrChain::new(ChainId(2), StreamId(0));
        assert!(chain.add_in_edge(ChainId(1)));
        assert!(!chain.add_in_edge(ChainId(1)));
        assert_eq!(chain.unresolved_in_edges(), 1);
        assert!(!chain.is_ready());

        assert!(chain.resolve_in_edge(ChainId(1)));
        assert!(!chain.resolve_in_edge(ChainId(1)));
        assert!(chain.is_ready());
    }

    #[test]
    fn test_dispatched_chain_not_ready() {
        let mut chain = InstrChain::new(ChainId(0), StreamId(0));
        assert!(chain.is_ready());
        chain.set_state(ChainState::Dispatched);
        assert!(!chain.is_ready());
    }

    #[test]
    fn test_take_out_edges() {
        let mut chain = InstrChain::new(ChainId(0), StreamId(0));
        chain.add_out_edge(ChainId(3));
        chain.add_out_edge(ChainId(4));
        chain.add_out_edge(ChainId(3));
        let edges = chain.take_out_edges();
        assert_eq!(edges.into_iter().collect::<Vec<_>>(), vec![ChainId(3), ChainId(4)]);
        assert!(chain.out_edges().is_empty());
    }
}
