use vex_ir::Address;

/// Why the engine was halted. Ordinal values are part of the external
/// interface and must stay stable; new reasons are appended only.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum StopReason {
    /// The step budget was exhausted.
    Normal = 0,

    /// Execution reached a configured stop point.
    Stoppoint,

    /// The engine reported an unclassified error.
    Error,

    /// A system call was raised that the interrupt path did not consume.
    Syscall,

    /// Instruction fetch from unmapped memory.
    Execnone,

    /// Access to the zero page.
    Zeropage,

    /// The run ended before the first block was entered.
    NoStart,

    /// Unrecoverable memory fault.
    Segfault,

    /// Integer division by zero.
    ZeroDiv,

    /// The lifter could not decode the block bytes.
    Nodecode,

    /// The guest executed a halt instruction.
    Hlt,

    /// The lifter failed on the block; taint tracking cannot continue.
    VexLiftFailed,

    /// The previous block's exit guard became symbolic.
    SymbolicCondition,

    /// A symbolic value was written to the program counter.
    SymbolicPc,

    /// A memory read through a symbolic address.
    SymbolicReadAddr,

    /// A tainted value was read while symbolic tracking was disabled.
    SymbolicReadSymbolicTrackingDisabled,

    /// A memory write through a symbolic address.
    SymbolicWriteAddr,

    /// A block side-exit guard depends on symbolic data.
    SymbolicBlockExitStmt,

    /// One instruction performed more than one memory read.
    MultipleMemoryReads,

    UnsupportedStmtPuti,
    UnsupportedStmtStoreg,
    UnsupportedStmtLoadg,
    UnsupportedStmtCas,
    UnsupportedStmtLlsc,
    UnsupportedStmtDirty,
    UnsupportedStmtUnknown,
    UnsupportedExprGeti,
    UnsupportedExprUnknown,

    /// A memory write the core could not account for.
    UnknownMemoryWrite,

    /// A memory read the core could not account for.
    UnknownMemoryRead,
}

impl StopReason {
    /// Whether this stop hands control back for symbolic re-execution
    /// rather than reporting an error or normal termination.
    pub fn is_symbolic_boundary(self) -> bool {
        matches!(
            self,
            StopReason::SymbolicCondition
                | StopReason::SymbolicPc
                | StopReason::SymbolicReadAddr
                | StopReason::SymbolicReadSymbolicTrackingDisabled
                | StopReason::SymbolicWriteAddr
                | StopReason::SymbolicBlockExitStmt
                | StopReason::MultipleMemoryReads
        )
    }

    /// Whether this stop reflects an IR construct the analyzer rejects.
    pub fn is_unsupported_ir(self) -> bool {
        matches!(
            self,
            StopReason::UnsupportedStmtPuti
                | StopReason::UnsupportedStmtStoreg
                | StopReason::UnsupportedStmtLoadg
                | StopReason::UnsupportedStmtCas
                | StopReason::UnsupportedStmtLlsc
                | StopReason::UnsupportedStmtDirty
                | StopReason::UnsupportedStmtUnknown
                | StopReason::UnsupportedExprGeti
                | StopReason::UnsupportedExprUnknown
        )
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Where and why the last run halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StopDetails {
    pub reason: StopReason,
    pub block_addr: Address,
    pub block_size: u64,
}

impl Default for StopDetails {
    fn default() -> Self {
        Self {
            reason: StopReason::NoStart,
            block_addr: 0,
            block_size: 0,
        }
    }
}

impl std::fmt::Display for StopDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{reason} in block {addr:#x}+{size}",
            reason = self.reason,
            addr = self.block_addr,
            size = self.block_size
        )
    }
}
