use crate::{Address, RegOffset, TempId};

/// Unary operators. The exact operator is irrelevant to taint flow; the
/// variants exist so lifters can express real programs and so expression
/// trees print usefully.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UnOp {
    /// Bitwise complement: `!x`.
    Not,

    /// Two's complement negation: `-x`.
    Negate,

    /// Widen with zero bits to the annotated result size.
    ZeroExtend,

    /// Widen by replicating the sign bit to the annotated result size.
    SignExtend,

    /// Truncate to the annotated result size.
    Narrow,

    /// Count leading zero bits.
    CountLeadingZeros,
}

/// Binary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    UnsignedDivide,
    SignedDivide,
    And,
    Or,
    Xor,
    ShiftLeft,
    UnsignedShiftRight,
    SignedShiftRight,
    CmpEqual,
    CmpNotEqual,
    CmpUnsignedLessThan,
    CmpSignedLessThan,
    CmpUnsignedLessOrEqual,
    CmpSignedLessOrEqual,
}

/// Kind of control transfer a block or side exit performs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum JumpKind {
    /// Ordinary jump or fall-through.
    Boring,

    /// Function call.
    Call,

    /// Function return.
    Ret,

    /// System call; control should pass to the interrupt path.
    Syscall,

    /// The lifter could not decode the bytes at the destination.
    NoDecode,
}

/// An expression of the lifted IR. Expressions are trees over register
/// reads, temporary reads, memory loads and constants.
///
/// A [IrExpr::Load] may appear only as the immediate right-hand side of a
/// [IrStmt::WrTmp]; lifters emitting this IR always route loaded values
/// through a temporary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrExpr {
    /// A literal value of `size` bytes.
    Const { value: u64, size: usize },

    /// Read of an intra-block temporary.
    RdTmp(TempId),

    /// Read of `size` bytes of guest register state at `offset`.
    Get { offset: RegOffset, size: usize },

    /// Read of a register file element selected by a runtime index, used by
    /// lifters for rotating register files. Not supported by the analyzer.
    GetI { base: RegOffset, ix: Box<IrExpr> },

    /// Load of `size` bytes from the address computed by `addr`.
    Load { addr: Box<IrExpr>, size: usize },

    /// Application of a unary operator.
    Unop { op: UnOp, arg: Box<IrExpr> },

    /// Application of a binary operator.
    Binop {
        op: BinOp,
        lhs: Box<IrExpr>,
        rhs: Box<IrExpr>,
    },

    /// If-then-else over a condition expression.
    Ite {
        cond: Box<IrExpr>,
        if_true: Box<IrExpr>,
        if_false: Box<IrExpr>,
    },

    /// Call to a pure helper function supplied by the lifter. The result
    /// depends on every argument.
    CCall { args: Vec<IrExpr>, ret_size: usize },

    /// An expression form this model does not represent. Lifters emit this
    /// in place of constructs the consumer is expected to reject.
    Unknown,
}

impl IrExpr {
    /// Convenience constructor for a register read.
    pub fn get(offset: RegOffset, size: usize) -> Self {
        IrExpr::Get { offset, size }
    }

    /// Convenience constructor for a load through an address expression.
    pub fn load(addr: IrExpr, size: usize) -> Self {
        IrExpr::Load {
            addr: Box::new(addr),
            size,
        }
    }

    /// Convenience constructor for a binary operator node.
    pub fn binop(op: BinOp, lhs: IrExpr, rhs: IrExpr) -> Self {
        IrExpr::Binop {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Convenience constructor for an if-then-else node.
    pub fn ite(cond: IrExpr, if_true: IrExpr, if_false: IrExpr) -> Self {
        IrExpr::Ite {
            cond: Box::new(cond),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }
}

impl std::fmt::Display for IrExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrExpr::Const { value, size } => write!(f, "{value:#x}:{size}"),
            IrExpr::RdTmp(tmp) => write!(f, "t{tmp}"),
            IrExpr::Get { offset, size } => write!(f, "r{offset}:{size}"),
            IrExpr::GetI { base, ix } => write!(f, "r[{base}+{ix}]"),
            IrExpr::Load { addr, size } => write!(f, "load:{size}({addr})"),
            IrExpr::Unop { op, arg } => write!(f, "{op:?}({arg})"),
            IrExpr::Binop { op, lhs, rhs } => write!(f, "{op:?}({lhs},{rhs})"),
            IrExpr::Ite {
                cond,
                if_true,
                if_false,
            } => write!(f, "ite({cond},{if_true},{if_false})"),
            IrExpr::CCall { args, ret_size } => {
                write!(f, "ccall:{ret_size}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            IrExpr::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// A statement of the lifted IR.
///
/// The unsupported variants ([IrStmt::PutI], [IrStmt::StoreG],
/// [IrStmt::LoadG], [IrStmt::Cas], [IrStmt::LlSc], [IrStmt::Dirty] and
/// [IrStmt::Unknown]) are part of the model so lifters can surface them;
/// consumers reject them with a statement-specific reason rather than
/// guessing at their data flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrStmt {
    /// Marks the start of the guest instruction at `addr` spanning `len`
    /// bytes. Every subsequent statement belongs to this instruction until
    /// the next mark.
    Imark { addr: Address, len: usize },

    /// No operation.
    NoOp,

    /// ABI hint from the lifter; carries no data flow.
    AbiHint,

    /// Memory bus event (fence); carries no data flow.
    Mbe,

    /// Write `data` to guest register state at `offset`.
    Put { offset: RegOffset, data: IrExpr },

    /// Write to a register file element selected by a runtime index.
    PutI {
        base: RegOffset,
        ix: IrExpr,
        data: IrExpr,
    },

    /// Write `data` to the temporary `tmp`.
    WrTmp { tmp: TempId, data: IrExpr },

    /// Store `data` to the address computed by `addr`.
    Store { addr: IrExpr, data: IrExpr },

    /// Guarded store.
    StoreG {
        guard: IrExpr,
        addr: IrExpr,
        data: IrExpr,
    },

    /// Guarded load with fallback.
    LoadG {
        guard: IrExpr,
        tmp: TempId,
        addr: IrExpr,
        alt: IrExpr,
    },

    /// Compare-and-swap.
    Cas {
        addr: IrExpr,
        expected: IrExpr,
        data: IrExpr,
        old: TempId,
    },

    /// Load-linked (`data` absent) or store-conditional (`data` present).
    LlSc {
        addr: IrExpr,
        data: Option<IrExpr>,
        result: TempId,
    },

    /// Call to an impure helper with unmodelled side effects.
    Dirty { args: Vec<IrExpr>, tmp: Option<TempId> },

    /// Conditional side exit: when `guard` is non-zero, control leaves the
    /// block for `dst`.
    Exit {
        guard: IrExpr,
        dst: Address,
        jump_kind: JumpKind,
    },

    /// A statement form this model does not represent.
    Unknown,
}

impl std::fmt::Display for IrStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrStmt::Imark { addr, len } => write!(f, "---- imark {addr:#x}+{len}"),
            IrStmt::NoOp => write!(f, "nop"),
            IrStmt::AbiHint => write!(f, "abihint"),
            IrStmt::Mbe => write!(f, "mbe"),
            IrStmt::Put { offset, data } => write!(f, "put r{offset} <- {data}"),
            IrStmt::PutI { base, ix, data } => write!(f, "puti r[{base}+{ix}] <- {data}"),
            IrStmt::WrTmp { tmp, data } => write!(f, "t{tmp} <- {data}"),
            IrStmt::Store { addr, data } => write!(f, "store ({addr}) <- {data}"),
            IrStmt::StoreG { guard, addr, data } => {
                write!(f, "storeg if {guard}: ({addr}) <- {data}")
            }
            IrStmt::LoadG {
                guard,
                tmp,
                addr,
                alt,
            } => write!(f, "loadg t{tmp} <- if {guard} ({addr}) else {alt}"),
            IrStmt::Cas {
                addr,
                expected,
                data,
                old,
            } => write!(f, "cas t{old} <- ({addr}) {expected} => {data}"),
            IrStmt::LlSc { addr, data, result } => match data {
                Some(data) => write!(f, "sc t{result} <- ({addr}) {data}"),
                None => write!(f, "ll t{result} <- ({addr})"),
            },
            IrStmt::Dirty { tmp, .. } => match tmp {
                Some(tmp) => write!(f, "dirty t{tmp}"),
                None => write!(f, "dirty"),
            },
            IrStmt::Exit {
                guard,
                dst,
                jump_kind,
            } => write!(f, "exit if {guard} -> {dst:#x} ({jump_kind:?})"),
            IrStmt::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// A lifted basic block: the statements of a straight-line run of guest
/// instructions plus the expression computing the next program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrBlock {
    /// Statements in program order.
    pub stmts: Vec<IrStmt>,

    /// Address of the instruction following the block when no side exit is
    /// taken.
    pub next: IrExpr,

    /// Control-transfer kind of the block-ending jump.
    pub jump_kind: JumpKind,
}

impl IrBlock {
    /// Address of the first guest instruction in the block, taken from the
    /// leading instruction mark.
    pub fn first_instr_addr(&self) -> Option<Address> {
        self.stmts.iter().find_map(|stmt| match stmt {
            IrStmt::Imark { addr, .. } => Some(*addr),
            _ => None,
        })
    }

    /// Number of guest instructions in the block.
    pub fn instr_count(&self) -> usize {
        self.stmts
            .iter()
            .filter(|stmt| matches!(stmt, IrStmt::Imark { .. }))
            .count()
    }
}

impl std::fmt::Display for IrBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for stmt in &self.stmts {
            writeln!(f, "{stmt}")?;
        }
        write!(
            f,
            "next: {next} ({kind:?})",
            next = self.next,
            kind = self.jump_kind
        )
    }
}
