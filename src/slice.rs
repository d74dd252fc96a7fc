//! Intra-block dependency slices.
//!
//! When an instruction is flagged for symbolic re-execution, the symbolic
//! executor must be able to reproduce the concrete values the instruction
//! consumed. The slice of an instruction is the set of earlier in-block
//! instructions whose side effects produce those values, plus the concrete
//! register snapshot for values produced before the block. Slice state is
//! reset at every block entry; a jump back into the middle of a block is
//! treated as a fresh block.

use std::collections::HashSet;

use vex_ir::{Address, RegOffset};

use crate::block::InstrDetails;
use crate::taint::{InstrTaintEntry, TaintEntity};
use crate::State;

/// Slice of one instruction: the producing instructions it depends on and
/// the registers whose values predate the block.
#[derive(Debug, Clone, Default)]
pub(crate) struct InstrSliceDetails {
    /// Dependent instructions, ascending by address.
    pub dependent_instrs: Vec<InstrDetails>,

    /// Concrete registers with no in-block producer.
    pub concrete_registers: HashSet<RegOffset>,
}

impl State {
    /// The replay record of one instruction, with the concrete memory
    /// value the engine read for it when it has one.
    pub(crate) fn compute_instr_details(
        &self,
        instr_addr: Address,
        instr_entry: &InstrTaintEntry,
    ) -> InstrDetails {
        match self.mem_reads_map.get(&instr_addr) {
            Some(read) if instr_entry.has_memory_read => InstrDetails {
                instr_addr,
                has_memory_dep: true,
                memory_value: read.memory_value(),
            },
            _ => InstrDetails::without_memory(instr_addr),
        }
    }

    /// Compute the slice of the instruction described by `instr_entry`:
    /// for every concrete register it reads, pull in the register's most
    /// recent in-block producers together with their own slices; registers
    /// produced before the block go into the snapshot set.
    pub(crate) fn compute_slice(&self, instr_entry: &InstrTaintEntry) -> InstrSliceDetails {
        let mut slice = InstrSliceDetails::default();

        for offset in self.concrete_register_sources(instr_entry) {
            match self.reg_instr_slice.get(&offset) {
                Some(producers) => {
                    for producer in producers {
                        // A producer's own slice is already transitively
                        // closed, so one level of lookup suffices.
                        if let Some(producer_slice) =
                            self.instr_slice_details.get(&producer.instr_addr)
                        {
                            for dep in &producer_slice.dependent_instrs {
                                push_unique(&mut slice.dependent_instrs, *dep);
                            }
                            slice
                                .concrete_registers
                                .extend(producer_slice.concrete_registers.iter().copied());
                        }
                        push_unique(&mut slice.dependent_instrs, *producer);
                    }
                }
                None => {
                    slice.concrete_registers.insert(offset);
                }
            }
        }

        slice.dependent_instrs.sort_by_key(|detail| detail.instr_addr);
        slice
    }

    /// Record a concrete instruction as the latest producer of the
    /// registers it modifies. A value that folds in the register's prior
    /// contents extends the producer chain instead of replacing it.
    pub(crate) fn update_register_slice(
        &mut self,
        instr_entry: &InstrTaintEntry,
        details: InstrDetails,
    ) {
        for &(offset, depends_on_prior) in &instr_entry.modified_regs {
            let full = self.regs.full_register_offset(offset);
            if !self.regs.is_valid_dependency(full) {
                continue;
            }

            let producers = self.reg_instr_slice.entry(full).or_default();
            if depends_on_prior {
                producers.push(details);
            } else {
                producers.clear();
                producers.push(details);
            }
        }
    }

    /// Attach a flagged instruction and its slice to the block's
    /// re-execution record.
    pub(crate) fn flag_instruction(&mut self, instr_addr: Address, details: InstrDetails) {
        let slice = self
            .instr_slice_details
            .get(&instr_addr)
            .cloned()
            .unwrap_or_default();

        for dep in slice.dependent_instrs {
            push_unique(&mut self.block_details.symbolic_instrs, dep);
        }
        push_unique(&mut self.block_details.symbolic_instrs, details);
        self.block_details
            .symbolic_instrs
            .sort_by_key(|detail| detail.instr_addr);

        for offset in slice.concrete_registers {
            // Snapshot each register at most once per block.
            if self.block_concrete_dependencies.insert(offset) {
                if let Some(value) = self.block_start_reg_values.get(&offset) {
                    self.block_details.register_values.push(*value);
                }
            }
        }
    }

    /// Registers the instruction reads whose current taint is concrete,
    /// folded to full registers and filtered to saveable ones.
    fn concrete_register_sources(&self, instr_entry: &InstrTaintEntry) -> Vec<RegOffset> {
        let mut offsets: Vec<RegOffset> = Vec::new();
        let mut push = |offset: RegOffset, state: &State| {
            let full = state.regs.full_register_offset(offset);
            if state.regs.is_valid_dependency(full)
                && !state.is_symbolic_register(full)
                && !offsets.contains(&full)
            {
                offsets.push(full);
            }
        };

        for (_, sources) in &instr_entry.sink_src_map {
            for source in sources {
                match source {
                    TaintEntity::Reg(offset) => push(*offset, self),
                    TaintEntity::Mem { deps, .. } => {
                        for dep in deps {
                            if let TaintEntity::Reg(offset) = dep {
                                push(*offset, self);
                            }
                        }
                    }
                    TaintEntity::Tmp(_) => {}
                }
            }
        }
        for entity in &instr_entry.ite_cond_entities {
            if let TaintEntity::Reg(offset) = entity {
                push(*offset, self);
            }
        }

        offsets
    }
}

fn push_unique(list: &mut Vec<InstrDetails>, details: InstrDetails) {
    if !list
        .iter()
        .any(|existing| existing.instr_addr == details.instr_addr)
    {
        list.push(details);
    }
}
