use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use vex_ir::{Address, RegOffset, TempId};

use crate::stop::StopReason;

/// Something taint can be associated with: a guest register, an intra-block
/// temporary, or a memory location addressed by an expression over other
/// entities.
///
/// A [TaintEntity::Mem] never nests another `Mem`; the analyzer flattens
/// address expressions to their register and temporary leaves before
/// constructing one.
#[derive(Debug, Clone, Eq)]
pub enum TaintEntity {
    /// A register identified by its lifter byte offset.
    Reg(RegOffset),

    /// An intra-block temporary.
    Tmp(TempId),

    /// A memory location whose address is computed from `deps`. The
    /// instruction address names the use site when the entity is a taint
    /// sink; it does not participate in equality or hashing.
    Mem {
        deps: Vec<TaintEntity>,
        instr_addr: Address,
    },
}

impl TaintEntity {
    /// The instruction address carried by a memory sink, if any.
    pub fn instr_addr(&self) -> Option<Address> {
        match self {
            TaintEntity::Mem { instr_addr, .. } => Some(*instr_addr),
            _ => None,
        }
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, TaintEntity::Reg(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, TaintEntity::Mem { .. })
    }
}

impl PartialEq for TaintEntity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaintEntity::Reg(a), TaintEntity::Reg(b)) => a == b,
            (TaintEntity::Tmp(a), TaintEntity::Tmp(b)) => a == b,
            // The ordered dependency list is the identity of a memory
            // entity; the use-site address is not.
            (TaintEntity::Mem { deps: a, .. }, TaintEntity::Mem { deps: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for TaintEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TaintEntity::Reg(offset) => {
                0u8.hash(state);
                offset.hash(state);
            }
            TaintEntity::Tmp(tmp) => {
                1u8.hash(state);
                tmp.hash(state);
            }
            TaintEntity::Mem { deps, .. } => {
                2u8.hash(state);
                for dep in deps {
                    dep.hash(state);
                }
            }
        }
    }
}

impl std::fmt::Display for TaintEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaintEntity::Reg(offset) => write!(f, "r{offset}"),
            TaintEntity::Tmp(tmp) => write!(f, "t{tmp}"),
            TaintEntity::Mem { deps, instr_addr } => {
                write!(f, "mem@{instr_addr:#x}[")?;
                for (i, dep) in deps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{dep}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Cumulative taint of a set of sources.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TaintStatus {
    /// Every source is concrete.
    #[default]
    Concrete,

    /// Some source is a memory read whose address depends on symbolic
    /// data. The read cannot be resolved concretely at all, so this
    /// dominates [TaintStatus::Symbolic].
    DependsOnSymbolicReadAddr,

    /// Some source is symbolic.
    Symbolic,
}

impl TaintStatus {
    /// Fold another source's status into this one.
    pub fn combine(self, other: TaintStatus) -> TaintStatus {
        match (self, other) {
            (TaintStatus::DependsOnSymbolicReadAddr, _)
            | (_, TaintStatus::DependsOnSymbolicReadAddr) => {
                TaintStatus::DependsOnSymbolicReadAddr
            }
            (TaintStatus::Symbolic, _) | (_, TaintStatus::Symbolic) => TaintStatus::Symbolic,
            _ => TaintStatus::Concrete,
        }
    }

    pub fn is_symbolic(self) -> bool {
        self == TaintStatus::Symbolic
    }
}

/// Per-instruction product of the analyzer: how taint flows through one
/// guest instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrTaintEntry {
    /// Sink → sources pairs in statement order. Order matters: a later
    /// sink within the instruction can depend on an earlier one.
    pub sink_src_map: Vec<(TaintEntity, HashSet<TaintEntity>)>,

    /// Registers whose concrete values must be snapshotted if this
    /// instruction is re-executed symbolically. Never contains artificial
    /// or blacklisted registers.
    pub dependencies_to_save: HashSet<TaintEntity>,

    /// Entities appearing in any if-then-else condition within the
    /// instruction.
    pub ite_cond_entities: HashSet<TaintEntity>,

    /// Registers the instruction writes, with whether the new value
    /// depends on the register's prior value.
    pub modified_regs: Vec<(RegOffset, bool)>,

    pub has_memory_read: bool,
    pub has_memory_write: bool,
}

impl InstrTaintEntry {
    /// Whether the instruction has any taint flow worth propagating.
    pub fn is_empty(&self) -> bool {
        self.sink_src_map.is_empty() && !self.has_memory_read && !self.has_memory_write
    }
}

/// Per-block product of the analyzer, memoized by block start address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockTaintEntry {
    /// Instruction address → taint entry; iteration order equals
    /// execution order.
    pub instr_entries: BTreeMap<Address, InstrTaintEntry>,

    /// Entities read by the block's side-exit guards.
    pub exit_guard_deps: HashSet<TaintEntity>,

    /// Address of the instruction containing the last side exit, when one
    /// exists.
    pub exit_instr_addr: Option<Address>,

    /// Set when the block contains a statement or expression the analyzer
    /// cannot model: the address of the offending instruction and the
    /// matching stop reason. The entry still describes every instruction
    /// before that one.
    pub unsupported: Option<(Address, StopReason)>,
}

impl BlockTaintEntry {
    pub fn is_complete(&self) -> bool {
        self.unsupported.is_none()
    }
}
