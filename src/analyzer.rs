//! Static per-block taint-flow analysis.
//!
//! The analyzer walks a lifted block once and records, for every guest
//! instruction, how taint moves between registers, temporaries and memory.
//! The result is purely a function of the block's IR; the propagator later
//! drives it forward under the run's actual symbolic state.

use std::collections::HashSet;

use log::trace;
use vex_ir::{Address, IrBlock, IrExpr, IrStmt, RegOffset, TempId};

use crate::regs::RegisterInfo;
use crate::stop::StopReason;
use crate::taint::{BlockTaintEntry, InstrTaintEntry, TaintEntity};

/// Taint sources of one expression: the leaf entities the expression reads,
/// in evaluation order, plus any if-then-else condition entities met along
/// the way.
#[derive(Debug, Default)]
struct ExprTaint {
    /// Leaf entities in left-to-right evaluation order. Order matters for
    /// memory address expressions, whose entity list is identity-bearing.
    sources: Vec<TaintEntity>,

    /// Entities read by if-then-else conditions inside the expression.
    ite_cond_entities: Vec<TaintEntity>,

    /// First unsupported expression form encountered, if any.
    unsupported: Option<StopReason>,
}

impl ExprTaint {
    fn of(expr: &IrExpr, instr_addr: Address) -> Self {
        let mut taint = ExprTaint::default();
        taint.walk(expr, instr_addr);
        taint
    }

    fn walk(&mut self, expr: &IrExpr, instr_addr: Address) {
        if self.unsupported.is_some() {
            return;
        }

        match expr {
            IrExpr::Const { .. } => {}
            IrExpr::RdTmp(tmp) => self.sources.push(TaintEntity::Tmp(*tmp)),
            IrExpr::Get { offset, .. } => self.sources.push(TaintEntity::Reg(*offset)),
            IrExpr::GetI { .. } => {
                self.unsupported = Some(StopReason::UnsupportedExprGeti);
            }
            IrExpr::Load { addr, .. } => {
                // The loaded value depends on whatever the address reads.
                // Flattening the address to its leaves keeps memory
                // entities one level deep even for nested loads.
                let mut addr_taint = ExprTaint::default();
                addr_taint.walk(addr, instr_addr);
                if let Some(reason) = addr_taint.unsupported {
                    self.unsupported = Some(reason);
                    return;
                }
                self.ite_cond_entities.extend(addr_taint.ite_cond_entities);
                self.sources.push(TaintEntity::Mem {
                    deps: addr_taint
                        .sources
                        .into_iter()
                        .filter(|entity| !entity.is_mem())
                        .collect(),
                    instr_addr,
                });
            }
            IrExpr::Unop { arg, .. } => self.walk(arg, instr_addr),
            IrExpr::Binop { lhs, rhs, .. } => {
                self.walk(lhs, instr_addr);
                self.walk(rhs, instr_addr);
            }
            IrExpr::Ite {
                cond,
                if_true,
                if_false,
            } => {
                // Both arms and the condition are sources; the condition is
                // additionally remembered so a symbolic predicate flags the
                // instruction even when the chosen value is concrete.
                let before = self.sources.len();
                self.walk(cond, instr_addr);
                self.ite_cond_entities.extend(self.sources[before..].to_vec());
                self.walk(if_true, instr_addr);
                self.walk(if_false, instr_addr);
            }
            IrExpr::CCall { args, .. } => {
                for arg in args {
                    self.walk(arg, instr_addr);
                }
            }
            IrExpr::Unknown => {
                self.unsupported = Some(StopReason::UnsupportedExprUnknown);
            }
        }
    }

    fn source_set(&self) -> HashSet<TaintEntity> {
        self.sources.iter().cloned().collect()
    }

    fn contains_reg(&self, offset: RegOffset) -> bool {
        self.sources
            .iter()
            .any(|entity| matches!(entity, TaintEntity::Reg(reg) if *reg == offset))
    }

    fn has_load(&self) -> bool {
        self.sources.iter().any(TaintEntity::is_mem)
    }
}

struct BlockAnalysis<'a> {
    regs: &'a RegisterInfo,
    entry: BlockTaintEntry,
    current_instr: Option<Address>,
}

/// Analyze one lifted block starting at `block_addr` into a
/// [BlockTaintEntry]. On an unsupported statement or expression the entry
/// is returned with [BlockTaintEntry::unsupported] set and every earlier
/// instruction fully described, so the caller can stop exactly at the
/// offending point.
pub fn analyze_block(block: &IrBlock, block_addr: Address, regs: &RegisterInfo) -> BlockTaintEntry {
    let mut analysis = BlockAnalysis {
        regs,
        entry: BlockTaintEntry::default(),
        current_instr: None,
    };

    for stmt in &block.stmts {
        if analysis.entry.unsupported.is_some() {
            break;
        }
        analysis.statement(stmt);
    }

    // The block's next-address expression writes the program counter; a
    // symbolic next target has to stop the run the same way an explicit
    // symbolic PC put does.
    if analysis.entry.unsupported.is_none() {
        if let Some(pc_offset) = regs.pc_offset() {
            if let Some(instr_addr) = analysis.current_instr {
                let taint = ExprTaint::of(&block.next, instr_addr);
                match taint.unsupported {
                    Some(reason) => analysis.mark_unsupported(reason),
                    None if !taint.sources.is_empty() => {
                        analysis.sink(
                            instr_addr,
                            TaintEntity::Reg(pc_offset),
                            &taint,
                            /* track_modified */ false,
                        );
                    }
                    None => {}
                }
            }
        }
    }

    trace!(
        "analyzed block {block_addr:#x}: {instrs} instruction(s), complete: {complete}",
        instrs = analysis.entry.instr_entries.len(),
        complete = analysis.entry.is_complete()
    );

    analysis.entry
}

impl BlockAnalysis<'_> {
    fn statement(&mut self, stmt: &IrStmt) {
        match stmt {
            IrStmt::Imark { addr, .. } => {
                self.current_instr = Some(*addr);
                self.entry.instr_entries.entry(*addr).or_default();
            }
            IrStmt::NoOp | IrStmt::AbiHint | IrStmt::Mbe => {}
            IrStmt::Put { offset, data } => self.put(*offset, data),
            IrStmt::WrTmp { tmp, data } => self.wrtmp(*tmp, data),
            IrStmt::Store { addr, data } => self.store(addr, data),
            IrStmt::Exit { guard, .. } => self.exit(guard),
            IrStmt::PutI { .. } => self.mark_unsupported(StopReason::UnsupportedStmtPuti),
            IrStmt::StoreG { .. } => self.mark_unsupported(StopReason::UnsupportedStmtStoreg),
            IrStmt::LoadG { .. } => self.mark_unsupported(StopReason::UnsupportedStmtLoadg),
            IrStmt::Cas { .. } => self.mark_unsupported(StopReason::UnsupportedStmtCas),
            IrStmt::LlSc { .. } => self.mark_unsupported(StopReason::UnsupportedStmtLlsc),
            IrStmt::Dirty { .. } => self.mark_unsupported(StopReason::UnsupportedStmtDirty),
            IrStmt::Unknown => self.mark_unsupported(StopReason::UnsupportedStmtUnknown),
        }
    }

    fn put(&mut self, offset: RegOffset, data: &IrExpr) {
        let Some(instr_addr) = self.current_instr else {
            return;
        };

        let taint = ExprTaint::of(data, instr_addr);
        if let Some(reason) = taint.unsupported {
            self.mark_unsupported(reason);
            return;
        }

        self.sink(instr_addr, TaintEntity::Reg(offset), &taint, true);
    }

    fn wrtmp(&mut self, tmp: TempId, data: &IrExpr) {
        let Some(instr_addr) = self.current_instr else {
            return;
        };

        let taint = ExprTaint::of(data, instr_addr);
        if let Some(reason) = taint.unsupported {
            self.mark_unsupported(reason);
            return;
        }

        if taint.has_load() {
            self.instr_entry(instr_addr).has_memory_read = true;
        }

        self.sink(instr_addr, TaintEntity::Tmp(tmp), &taint, false);
    }

    fn store(&mut self, addr: &IrExpr, data: &IrExpr) {
        let Some(instr_addr) = self.current_instr else {
            return;
        };

        let addr_taint = ExprTaint::of(addr, instr_addr);
        let data_taint = ExprTaint::of(data, instr_addr);
        if let Some(reason) = addr_taint.unsupported.or(data_taint.unsupported) {
            self.mark_unsupported(reason);
            return;
        }

        let sink = TaintEntity::Mem {
            deps: addr_taint
                .sources
                .iter()
                .filter(|entity| !entity.is_mem())
                .cloned()
                .collect(),
            instr_addr,
        };

        // The stored value depends on the data and on the address used to
        // place it.
        let mut sources = data_taint.source_set();
        sources.extend(addr_taint.sources.iter().cloned());

        self.record_dependencies(instr_addr, sources.iter());
        let entry = self.instr_entry(instr_addr);
        entry.has_memory_write = true;
        entry
            .ite_cond_entities
            .extend(addr_taint.ite_cond_entities.iter().cloned());
        entry
            .ite_cond_entities
            .extend(data_taint.ite_cond_entities.iter().cloned());
        entry.sink_src_map.push((sink, sources));
    }

    fn exit(&mut self, guard: &IrExpr) {
        let Some(instr_addr) = self.current_instr else {
            return;
        };

        let taint = ExprTaint::of(guard, instr_addr);
        if let Some(reason) = taint.unsupported {
            self.mark_unsupported(reason);
            return;
        }

        self.record_dependencies(instr_addr, taint.sources.iter());
        self.entry.exit_guard_deps.extend(taint.sources.into_iter());
        self.entry.exit_instr_addr = Some(instr_addr);
    }

    /// Record one sink/sources pair for the instruction at `instr_addr`,
    /// together with its dependency and modified-register bookkeeping.
    fn sink(
        &mut self,
        instr_addr: Address,
        sink: TaintEntity,
        taint: &ExprTaint,
        track_modified: bool,
    ) {
        self.record_dependencies(instr_addr, taint.sources.iter());

        if track_modified {
            if let TaintEntity::Reg(offset) = sink {
                let depends_on_self = taint.contains_reg(offset);
                self.instr_entry(instr_addr)
                    .modified_regs
                    .push((offset, depends_on_self));
            }
        }

        let entry = self.instr_entry(instr_addr);
        if taint.has_load() {
            entry.has_memory_read = true;
        }
        entry
            .ite_cond_entities
            .extend(taint.ite_cond_entities.iter().cloned());
        entry.sink_src_map.push((sink, taint.source_set()));
    }

    /// Add the register sources among `sources` to the instruction's
    /// concrete-snapshot list, folded to full registers and filtered to
    /// registers that may legitimately be saved.
    fn record_dependencies<'e>(
        &mut self,
        instr_addr: Address,
        sources: impl Iterator<Item = &'e TaintEntity>,
    ) {
        let mut deps: Vec<RegOffset> = Vec::new();
        for entity in sources {
            match entity {
                TaintEntity::Reg(offset) => deps.push(*offset),
                TaintEntity::Mem { deps: addr_deps, .. } => {
                    for dep in addr_deps {
                        if let TaintEntity::Reg(offset) = dep {
                            deps.push(*offset);
                        }
                    }
                }
                TaintEntity::Tmp(_) => {}
            }
        }

        let entry = self.entry.instr_entries.entry(instr_addr).or_default();
        for offset in deps {
            let full = self.regs.full_register_offset(offset);
            if self.regs.is_valid_dependency(full) {
                entry.dependencies_to_save.insert(TaintEntity::Reg(full));
            }
        }
    }

    fn instr_entry(&mut self, instr_addr: Address) -> &mut InstrTaintEntry {
        self.entry.instr_entries.entry(instr_addr).or_default()
    }

    /// Record the unsupported construct and drop the partially analyzed
    /// current instruction; everything before it stays valid.
    fn mark_unsupported(&mut self, reason: StopReason) {
        let instr_addr = self.current_instr.unwrap_or_default();
        self.entry.instr_entries.remove(&instr_addr);
        self.entry.unsupported = Some((instr_addr, reason));
    }
}
