use std::collections::{BTreeMap, BTreeSet};

use crate::error::EngineError;
use crate::ir::{ExceptionHandler, Instruction};
use crate::opcodes;
use crate::stream::InstructionStream;

/// Per-method control-flow facts computed once before simulation.
#[derive(Clone, Debug, Default)]
pub(crate) struct FlowFacts {
    predecessors: BTreeMap<u32, usize>,
    handler_starts: BTreeMap<u32, Option<String>>,
    loops: Vec<LoopRegion>,
}

/// Span closed by a backward branch, `head..=back_edge`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LoopRegion {
    pub(crate) head: u32,
    pub(crate) back_edge: u32,
    /// Local slots written by stores or `iinc` inside the loop body.
    pub(crate) stored_locals: BTreeSet<u16>,
}

impl FlowFacts {
    /// Number of control-flow predecessors of the instruction at `offset`.
    pub(crate) fn predecessor_count(&self, offset: u32) -> usize {
        self.predecessors.get(&offset).copied().unwrap_or(0)
    }

    pub(crate) fn is_merge_point(&self, offset: u32) -> bool {
        self.predecessor_count(offset) > 1
    }

    /// Catch type of the handler starting at `offset`; `Some(None)` for catch-all.
    pub(crate) fn handler_at(&self, offset: u32) -> Option<Option<&str>> {
        self.handler_starts
            .get(&offset)
            .map(|catch_type| catch_type.as_deref())
    }

    pub(crate) fn loops(&self) -> &[LoopRegion] {
        &self.loops
    }

    /// Loops whose head is `offset`.
    pub(crate) fn loops_starting_at(&self, offset: u32) -> impl Iterator<Item = &LoopRegion> {
        self.loops.iter().filter(move |region| region.head == offset)
    }
}

/// Scan `stream` once, resolving every jump so out-of-range targets surface
/// before any detector sees the method.
pub(crate) fn analyze_flow(
    stream: &InstructionStream<'_>,
    handlers: &[ExceptionHandler],
) -> Result<FlowFacts, EngineError> {
    let mut facts = FlowFacts::default();
    for handler in handlers {
        stream.at(handler.handler_pc)?;
        facts
            .handler_starts
            .insert(handler.handler_pc, handler.catch_type.clone());
        *facts.predecessors.entry(handler.handler_pc).or_default() += 1;
    }

    let mut backward = Vec::new();
    for inst in stream.iter() {
        let targets = stream.jump_targets(inst)?;
        for target in &targets {
            stream.at(*target)?;
            *facts.predecessors.entry(*target).or_default() += 1;
            if *target <= inst.offset {
                backward.push((*target, inst.offset));
            }
        }
        if falls_through(inst.opcode) {
            let next = inst.next_offset();
            if (next as usize) < stream.code_length() {
                *facts.predecessors.entry(next).or_default() += 1;
            }
        }
    }

    for (head, back_edge) in backward {
        let stored_locals = stream
            .iter()
            .filter(|inst| inst.offset >= head && inst.offset <= back_edge)
            .filter(|inst| is_local_write(inst))
            .filter_map(Instruction::local_index)
            .collect();
        facts.loops.push(LoopRegion {
            head,
            back_edge,
            stored_locals,
        });
    }
    Ok(facts)
}

pub(crate) fn is_exit_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::IRETURN
            | opcodes::LRETURN
            | opcodes::FRETURN
            | opcodes::DRETURN
            | opcodes::ARETURN
            | opcodes::RETURN
            | opcodes::ATHROW
            | opcodes::RET
    )
}

pub(crate) fn is_unconditional_branch(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::GOTO | opcodes::GOTO_W | opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH
    )
}

/// Whether control can continue to the next instruction in program order.
pub(crate) fn falls_through(opcode: u8) -> bool {
    !is_exit_opcode(opcode) && !is_unconditional_branch(opcode)
}

fn is_local_write(inst: &Instruction) -> bool {
    matches!(
        inst.opcode,
        opcodes::ISTORE..=opcodes::ASTORE_3 | opcodes::IINC
    )
}
