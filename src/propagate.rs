//! Forward taint propagation over one block.
//!
//! The propagator walks the analyzer's [BlockTaintEntry] in instruction
//! order, folding each instruction's source taint into its sinks under the
//! run's current symbolic state. It runs ahead of the engine from the block
//! callback and parks whenever an instruction needs a memory value the
//! engine has not delivered yet; the read callback resumes it.

use std::sync::Arc;

use log::trace;
use vex_ir::{Address, RegOffset, TempId};

use crate::engine::{EngineContext, HookAction};
use crate::stop::StopReason;
use crate::taint::{BlockTaintEntry, InstrTaintEntry, TaintEntity, TaintStatus};
use crate::State;

impl State {
    /// Whether the register (folded to its full register) is symbolic in
    /// the in-flight block. Blacklisted registers carry no taint.
    pub(crate) fn is_symbolic_register(&self, offset: RegOffset) -> bool {
        let full = self.regs.full_register_offset(offset);
        if self.regs.is_blacklisted(full) {
            return false;
        }
        self.block_symbolic_registers.contains(&full)
    }

    pub(crate) fn is_symbolic_temp(&self, tmp: TempId) -> bool {
        self.block_symbolic_temps.contains(&tmp)
    }

    /// Mark a register symbolic, either in the in-flight block or in the
    /// persistent set.
    pub(crate) fn mark_register_symbolic(&mut self, offset: RegOffset, block_level: bool) {
        let full = self.regs.full_register_offset(offset);
        if block_level {
            self.block_symbolic_registers.insert(full);
            self.block_concrete_registers.remove(&full);
        } else {
            self.symbolic_registers.insert(full);
        }
    }

    /// Mark a register concrete. Only registers that may be saved as
    /// dependencies enter the block-level concrete set.
    pub(crate) fn mark_register_concrete(&mut self, offset: RegOffset, block_level: bool) {
        let full = self.regs.full_register_offset(offset);
        if block_level {
            self.block_symbolic_registers.remove(&full);
            if self.regs.is_valid_dependency(full) {
                self.block_concrete_registers.insert(full);
            }
        } else {
            self.symbolic_registers.remove(&full);
        }
    }

    pub(crate) fn mark_temp_symbolic(&mut self, tmp: TempId) {
        self.block_symbolic_temps.insert(tmp);
    }

    /// Fold the taint of a set of sources into one status.
    pub(crate) fn final_taint_status<'e>(
        &self,
        sources: impl IntoIterator<Item = &'e TaintEntity>,
    ) -> TaintStatus {
        let mut status = TaintStatus::Concrete;
        for entity in sources {
            let source_status = match entity {
                TaintEntity::Reg(offset) => {
                    if self.is_symbolic_register(*offset) {
                        TaintStatus::Symbolic
                    } else {
                        TaintStatus::Concrete
                    }
                }
                TaintEntity::Tmp(tmp) => {
                    if self.is_symbolic_temp(*tmp) {
                        TaintStatus::Symbolic
                    } else {
                        TaintStatus::Concrete
                    }
                }
                TaintEntity::Mem { deps, .. } => {
                    // A read whose address depends on symbolic data cannot
                    // be resolved concretely at all.
                    if self.final_taint_status(deps.iter()).is_symbolic() {
                        TaintStatus::DependsOnSymbolicReadAddr
                    } else {
                        TaintStatus::Concrete
                    }
                }
            };
            status = status.combine(source_status);
        }
        status
    }

    /// Prime the propagation state for a fresh block: the block-level
    /// symbolic set starts from the persistent set as of block entry.
    pub(crate) fn begin_propagation(&mut self, entry: Arc<BlockTaintEntry>) {
        self.block_symbolic_registers = self.symbolic_registers.clone();
        self.block_concrete_registers.clear();
        self.block_symbolic_temps.clear();
        self.taint_cursor = entry.instr_entries.keys().next().copied();
        self.mem_read_parked_at = None;
        self.cur_block_entry = Some(entry);
    }

    /// Drive propagation forward from the cursor until the block is fully
    /// processed, an instruction needs a memory value that has not arrived
    /// yet, or a stop is recorded.
    pub(crate) fn propagate_taints(&mut self, ctx: &mut dyn EngineContext) -> HookAction {
        let Some(entry) = self.cur_block_entry.as_ref().map(Arc::clone) else {
            return HookAction::Continue;
        };

        let Some(cursor) = self.taint_cursor else {
            return HookAction::Continue;
        };

        for (&instr_addr, instr_entry) in entry.instr_entries.range(cursor..) {
            if instr_entry.has_memory_read && !self.mem_reads_map.contains_key(&instr_addr) {
                trace!("propagation parked at {instr_addr:#x} awaiting memory read");
                self.mem_read_parked_at = Some(instr_addr);
                self.taint_cursor = Some(instr_addr);
                return HookAction::Continue;
            }

            if self
                .propagate_one_instr(ctx, instr_addr, instr_entry)
                .is_stop()
            {
                return HookAction::Stop;
            }
            self.taint_cursor = Some(instr_addr + 1);
        }

        self.taint_cursor = None;

        if let Some((instr_addr, reason)) = entry.unsupported {
            trace!("unsupported IR at {instr_addr:#x}");
            self.stop_with(ctx, reason);
            return HookAction::Stop;
        }

        // The block's own side-exit guard is judged once the whole block
        // has propagated, before the engine takes the branch.
        if entry.exit_instr_addr.is_some()
            && self
                .final_taint_status(entry.exit_guard_deps.iter())
                .is_symbolic()
        {
            self.stop_with(ctx, StopReason::SymbolicBlockExitStmt);
            return HookAction::Stop;
        }

        HookAction::Continue
    }

    /// Resume after the read callback recorded the value the parked
    /// instruction was waiting for.
    pub(crate) fn resume_after_mem_read(&mut self, ctx: &mut dyn EngineContext) -> HookAction {
        let Some(instr_addr) = self.mem_read_parked_at.take() else {
            return HookAction::Continue;
        };

        let Some(entry) = self.cur_block_entry.as_ref().map(Arc::clone) else {
            return HookAction::Continue;
        };
        let Some(instr_entry) = entry.instr_entries.get(&instr_addr) else {
            return HookAction::Continue;
        };

        if self
            .propagate_one_instr(ctx, instr_addr, instr_entry)
            .is_stop()
        {
            return HookAction::Stop;
        }

        self.taint_cursor = Some(instr_addr + 1);
        self.propagate_taints(ctx)
    }

    /// Whether the parked instruction's memory read goes through a
    /// symbolic address.
    pub(crate) fn parked_read_addr_symbolic(&self, instr_addr: Address) -> bool {
        let Some(entry) = &self.cur_block_entry else {
            return false;
        };
        let Some(instr_entry) = entry.instr_entries.get(&instr_addr) else {
            return false;
        };

        instr_entry.sink_src_map.iter().any(|(_, sources)| {
            sources.iter().any(|source| match source {
                TaintEntity::Mem { deps, .. } => {
                    self.final_taint_status(deps.iter()).is_symbolic()
                }
                _ => false,
            })
        })
    }

    /// Propagate taint through one instruction, updating the block-level
    /// sets, the slice bookkeeping and the re-execution record.
    fn propagate_one_instr(
        &mut self,
        ctx: &mut dyn EngineContext,
        instr_addr: Address,
        instr_entry: &InstrTaintEntry,
    ) -> HookAction {
        let read_value_symbolic = instr_entry.has_memory_read
            && self
                .mem_reads_map
                .get(&instr_addr)
                .is_some_and(|read| read.is_value_symbolic);

        let mut instr_symbolic = self
            .final_taint_status(instr_entry.ite_cond_entities.iter())
            .is_symbolic();

        for (sink, sources) in &instr_entry.sink_src_map {
            let mut status = self.final_taint_status(sources.iter());

            // The engine resolved this instruction's load; a tainted value
            // in memory taints the destination even though the address was
            // concrete.
            if read_value_symbolic && sources.iter().any(TaintEntity::is_mem) {
                status = status.combine(TaintStatus::Symbolic);
            }

            match status {
                TaintStatus::DependsOnSymbolicReadAddr => {
                    self.stop_with(ctx, StopReason::SymbolicReadAddr);
                    return HookAction::Stop;
                }
                TaintStatus::Symbolic => {
                    instr_symbolic = true;
                    match sink {
                        TaintEntity::Reg(offset) => {
                            let full = self.regs.full_register_offset(*offset);
                            if self.regs.pc_offset() == Some(full) {
                                self.stop_with(ctx, StopReason::SymbolicPc);
                                return HookAction::Stop;
                            }
                            self.mark_register_symbolic(*offset, true);
                        }
                        TaintEntity::Tmp(tmp) => self.mark_temp_symbolic(*tmp),
                        TaintEntity::Mem { deps, .. } => {
                            if self.final_taint_status(deps.iter()).is_symbolic() {
                                self.stop_with(ctx, StopReason::SymbolicWriteAddr);
                                return HookAction::Stop;
                            }
                            self.pending_store_taint.push_back((instr_addr, true));
                        }
                    }
                }
                TaintStatus::Concrete => match sink {
                    TaintEntity::Reg(offset) => self.mark_register_concrete(*offset, true),
                    TaintEntity::Tmp(tmp) => {
                        self.block_symbolic_temps.remove(tmp);
                    }
                    TaintEntity::Mem { deps, .. } => {
                        if self.final_taint_status(deps.iter()).is_symbolic() {
                            self.stop_with(ctx, StopReason::SymbolicWriteAddr);
                            return HookAction::Stop;
                        }
                        self.pending_store_taint.push_back((instr_addr, false));
                    }
                },
            }
        }

        let details = self.compute_instr_details(instr_addr, instr_entry);
        let slice = self.compute_slice(instr_entry);
        self.instr_slice_details.insert(instr_addr, slice);

        if instr_symbolic {
            trace!("instruction {instr_addr:#x} flagged for symbolic re-execution");
            self.flag_instruction(instr_addr, details);
        } else {
            self.update_register_slice(instr_entry, details);
        }

        HookAction::Continue
    }
}
