use std::collections::{HashMap, HashSet};

use vex_ir::RegOffset;

use crate::engine::EngineRegId;
use crate::MAX_REGISTER_BYTE_SIZE;

/// Mapping between the lifter's register offsets and the engine's register
/// identifiers, plus the register classifications the analyzer and
/// propagator consult.
///
/// Everything here is host configuration: the lifter and the engine number
/// registers independently, and only the host knows both schemes.
#[derive(Debug, Default)]
pub struct RegisterInfo {
    /// Lifter offset → engine register id, for full registers.
    to_engine: HashMap<RegOffset, EngineRegId>,

    /// Lifter offset of a sub-register → offset of its full register.
    sub_reg_to_reg: HashMap<RegOffset, RegOffset>,

    /// Lifter offset → register size in bytes.
    sizes: HashMap<RegOffset, usize>,

    /// Registers the lifter invents that have no engine counterpart.
    artificial: HashSet<RegOffset>,

    /// Registers the host excludes from concrete dependency snapshots.
    blacklist: HashSet<RegOffset>,

    /// Lifter offset of a CPU flag → bitmask of the flag within the
    /// engine's flags register. Routed through to hosts; per-flag symbolic
    /// semantics stay in the lifter configuration.
    cpu_flags: HashMap<RegOffset, u64>,

    /// Engine id of the flags register the masks apply to.
    flags_reg: Option<EngineRegId>,

    /// The program counter, when the host has identified it.
    pc: Option<(RegOffset, EngineRegId)>,

    /// Engine id of the stack pointer, used only for trace collection.
    sp_reg: Option<EngineRegId>,
}

impl RegisterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the lifter-offset → engine-register mapping.
    pub fn set_engine_mappings(&mut self, mappings: impl IntoIterator<Item = (RegOffset, EngineRegId)>) {
        self.to_engine = mappings.into_iter().collect();
    }

    /// Replace the sub-register → full-register mapping.
    pub fn set_sub_reg_mappings(
        &mut self,
        mappings: impl IntoIterator<Item = (RegOffset, RegOffset)>,
    ) {
        self.sub_reg_to_reg = mappings.into_iter().collect();
    }

    /// Replace the register size table. Sizes above
    /// [MAX_REGISTER_BYTE_SIZE] are clamped; snapshots cannot carry more.
    pub fn set_sizes(&mut self, sizes: impl IntoIterator<Item = (RegOffset, usize)>) {
        self.sizes = sizes
            .into_iter()
            .map(|(offset, size)| (offset, size.min(MAX_REGISTER_BYTE_SIZE)))
            .collect();
    }

    /// Replace the artificial register set.
    pub fn set_artificial(&mut self, regs: impl IntoIterator<Item = RegOffset>) {
        self.artificial = regs.into_iter().collect();
    }

    /// Replace the dependency blacklist.
    pub fn set_blacklist(&mut self, regs: impl IntoIterator<Item = RegOffset>) {
        self.blacklist = regs.into_iter().collect();
    }

    /// Replace the CPU flag bitmask table.
    pub fn set_cpu_flags(&mut self, flags: impl IntoIterator<Item = (RegOffset, u64)>) {
        self.cpu_flags = flags.into_iter().collect();
    }

    /// Set the engine id of the flags register.
    pub fn set_flags_reg(&mut self, reg: Option<EngineRegId>) {
        self.flags_reg = reg;
    }

    /// Identify the program counter in both numbering schemes.
    pub fn set_pc(&mut self, offset: RegOffset, engine_reg: EngineRegId) {
        self.pc = Some((offset, engine_reg));
    }

    /// Set the engine id of the stack pointer.
    pub fn set_sp_reg(&mut self, reg: Option<EngineRegId>) {
        self.sp_reg = reg;
    }

    /// Fold a sub-register offset to the offset of its full register.
    /// Offsets without a sub-register mapping fold to themselves.
    pub fn full_register_offset(&self, offset: RegOffset) -> RegOffset {
        self.sub_reg_to_reg.get(&offset).copied().unwrap_or(offset)
    }

    /// Engine register id for a lifter offset, if the register exists in
    /// the engine.
    pub fn engine_reg(&self, offset: RegOffset) -> Option<EngineRegId> {
        self.to_engine.get(&offset).copied()
    }

    /// Size of the register at `offset` in bytes.
    pub fn reg_size(&self, offset: RegOffset) -> Option<usize> {
        self.sizes.get(&offset).copied()
    }

    pub fn is_artificial(&self, offset: RegOffset) -> bool {
        self.artificial.contains(&offset)
    }

    pub fn is_blacklisted(&self, offset: RegOffset) -> bool {
        self.blacklist.contains(&offset)
    }

    /// Whether a register may appear in dependency snapshots or concrete
    /// register sets.
    pub fn is_valid_dependency(&self, offset: RegOffset) -> bool {
        !self.is_artificial(offset) && !self.is_blacklisted(offset)
    }

    /// Bitmask of a CPU flag register offset, when the offset names one.
    pub fn flag_mask(&self, offset: RegOffset) -> Option<u64> {
        self.cpu_flags.get(&offset).copied()
    }

    pub fn flags_reg(&self) -> Option<EngineRegId> {
        self.flags_reg
    }

    /// Lifter offset of the program counter, when configured.
    pub fn pc_offset(&self) -> Option<RegOffset> {
        self.pc.map(|(offset, _)| offset)
    }

    /// Engine id of the program counter, when configured.
    pub fn pc_engine_reg(&self) -> Option<EngineRegId> {
        self.pc.map(|(_, reg)| reg)
    }

    pub fn sp_reg(&self) -> Option<EngineRegId> {
        self.sp_reg
    }
}
