//! Flat C surface over [State].
//!
//! Hosts drive the core through an opaque handle: `ct_alloc` binds a
//! [State] to a host engine described by an [EngineOps] vtable, and the
//! host engine delivers its callbacks through the exported `ct_hook_*`
//! entry points, each carrying the handle. Lifters arrive as a [LifterOps]
//! vtable producing a flat statement/expression pool that is rebuilt into a
//! [vex_ir::IrBlock] on this side of the boundary.
//!
//! All functions are unsafe in the C sense: handles must originate from
//! `ct_alloc`, vtable function pointers must be valid for the lifetime of
//! the handle, and pointer/length pairs must describe readable memory.

use std::borrow::Cow;
use std::ffi::c_void;

use vex_ir::{
    Address, ArchInfo, BinOp, Endianness, GuestArch, IrBlock, IrExpr, IrStmt, JumpKind, Lifter,
    UnOp,
};

use crate::engine::{
    AccessKind, Engine, EngineContext, EngineRegId, EngineHooks, PagePerms, Result as EngineResult,
};
use crate::state::{State, TransmitDescriptor};
use crate::stop::StopReason;
use crate::{MAX_MEM_ACCESS_SIZE, MAX_REGISTER_BYTE_SIZE};

/// Engine status codes crossing the C boundary. Zero is success; the
/// listed codes map onto [crate::engine::Error] and anything else becomes
/// [crate::engine::Error::Failure].
pub const ENGINE_OK: i32 = 0;
pub const ENGINE_ERR_READ_UNMAPPED: i32 = 1;
pub const ENGINE_ERR_WRITE_UNMAPPED: i32 = 2;
pub const ENGINE_ERR_FETCH_UNMAPPED: i32 = 3;
pub const ENGINE_ERR_PROTECTION: i32 = 4;
pub const ENGINE_ERR_INSN_INVALID: i32 = 5;
pub const ENGINE_ERR_ZERO_DIV: i32 = 6;
pub const ENGINE_ERR_HALT: i32 = 7;

/// Host engine vtable. `ctx` is passed verbatim as the first argument of
/// every call. All functions return an engine status code.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct EngineOps {
    pub ctx: *mut c_void,
    pub reg_read: unsafe extern "C" fn(*mut c_void, u64, *mut u8, u64) -> i32,
    pub reg_write: unsafe extern "C" fn(*mut c_void, u64, *const u8, u64) -> i32,
    pub mem_read: unsafe extern "C" fn(*mut c_void, u64, *mut u8, u64) -> i32,
    pub mem_write: unsafe extern "C" fn(*mut c_void, u64, *const u8, u64) -> i32,
    pub mem_map: unsafe extern "C" fn(*mut c_void, u64, u64, u64) -> i32,
    /// Run from the given program counter until halt. Callbacks are
    /// delivered to the `ct_hook_*` entry points during this call.
    pub start: unsafe extern "C" fn(*mut c_void, u64) -> i32,
    /// Request an asynchronous halt of the current run.
    pub stop: unsafe extern "C" fn(*mut c_void) -> i32,
}

fn engine_error(code: i32) -> crate::engine::Error {
    use crate::engine::Error;
    match code {
        ENGINE_ERR_READ_UNMAPPED => Error::ReadUnmapped(0),
        ENGINE_ERR_WRITE_UNMAPPED => Error::WriteUnmapped(0),
        ENGINE_ERR_FETCH_UNMAPPED => Error::FetchUnmapped(0),
        ENGINE_ERR_PROTECTION => Error::Protection(0),
        ENGINE_ERR_INSN_INVALID => Error::InvalidInstruction,
        ENGINE_ERR_ZERO_DIV => Error::DivisionByZero,
        ENGINE_ERR_HALT => Error::Halted,
        code => Error::Failure(code),
    }
}

/// Adapter exposing a host [EngineOps] vtable as an [Engine].
struct FfiEngine {
    ops: EngineOps,
}

impl EngineContext for FfiEngine {
    fn reg_read(&mut self, reg: EngineRegId, out: &mut [u8]) -> EngineResult<()> {
        // SAFETY: `out` is a valid, writable slice for its whole length.
        let code =
            unsafe { (self.ops.reg_read)(self.ops.ctx, reg, out.as_mut_ptr(), out.len() as u64) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }

    fn reg_write(&mut self, reg: EngineRegId, data: &[u8]) -> EngineResult<()> {
        let code =
            unsafe { (self.ops.reg_write)(self.ops.ctx, reg, data.as_ptr(), data.len() as u64) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }

    fn mem_read(&mut self, addr: u64, out: &mut [u8]) -> EngineResult<()> {
        let code =
            unsafe { (self.ops.mem_read)(self.ops.ctx, addr, out.as_mut_ptr(), out.len() as u64) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> EngineResult<()> {
        let code =
            unsafe { (self.ops.mem_write)(self.ops.ctx, addr, data.as_ptr(), data.len() as u64) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }

    fn mem_map(&mut self, addr: u64, size: usize, perms: PagePerms) -> EngineResult<()> {
        let code = unsafe { (self.ops.mem_map)(self.ops.ctx, addr, size as u64, perms.bits()) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }

    fn request_stop(&mut self) {
        unsafe {
            (self.ops.stop)(self.ops.ctx);
        }
    }
}

impl Engine for FfiEngine {
    fn run(&mut self, pc: u64, _hooks: &mut dyn EngineHooks) -> EngineResult<()> {
        // Host engines route their callbacks through the exported
        // `ct_hook_*` entry points rather than through `hooks`.
        let code = unsafe { (self.ops.start)(self.ops.ctx, pc) };
        if code == ENGINE_OK {
            Ok(())
        } else {
            Err(engine_error(code))
        }
    }
}

// -- flat IR ----------------------------------------------------------------

pub const FLAT_EXPR_CONST: u32 = 0;
pub const FLAT_EXPR_RDTMP: u32 = 1;
pub const FLAT_EXPR_GET: u32 = 2;
pub const FLAT_EXPR_GETI: u32 = 3;
pub const FLAT_EXPR_LOAD: u32 = 4;
pub const FLAT_EXPR_UNOP: u32 = 5;
pub const FLAT_EXPR_BINOP: u32 = 6;
pub const FLAT_EXPR_ITE: u32 = 7;
pub const FLAT_EXPR_CCALL: u32 = 8;
pub const FLAT_EXPR_UNKNOWN: u32 = 9;

pub const FLAT_STMT_IMARK: u32 = 0;
pub const FLAT_STMT_NOOP: u32 = 1;
pub const FLAT_STMT_ABIHINT: u32 = 2;
pub const FLAT_STMT_MBE: u32 = 3;
pub const FLAT_STMT_PUT: u32 = 4;
pub const FLAT_STMT_PUTI: u32 = 5;
pub const FLAT_STMT_WRTMP: u32 = 6;
pub const FLAT_STMT_STORE: u32 = 7;
pub const FLAT_STMT_STOREG: u32 = 8;
pub const FLAT_STMT_LOADG: u32 = 9;
pub const FLAT_STMT_CAS: u32 = 10;
pub const FLAT_STMT_LLSC: u32 = 11;
pub const FLAT_STMT_DIRTY: u32 = 12;
pub const FLAT_STMT_EXIT: u32 = 13;
pub const FLAT_STMT_UNKNOWN: u32 = 14;

/// Sentinel for "no expression" in flat operand fields.
pub const FLAT_NONE: u64 = u64::MAX;

/// One expression node of a flattened block. Operand meaning by kind:
/// `Const(a=value, size)`, `RdTmp(a=tmp)`, `Get(a=offset, size)`,
/// `GetI(a=base, b=index expr)`, `Load(a=addr expr, size)`,
/// `Unop(a=op, b=arg expr)`, `Binop(a=op, b=lhs expr, c=rhs expr)`,
/// `Ite(a=cond expr, b=true expr, c=false expr)`,
/// `CCall(args=expr indices, size)`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FlatExpr {
    pub kind: u32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub args: *const u64,
    pub arg_count: u64,
    pub size: u64,
}

/// One statement of a flattened block. Operand meaning by kind:
/// `Imark(a=addr, b=len)`, `Put(a=offset, b=data expr)`,
/// `PutI(a=base, b=index expr, c=data expr)`,
/// `WrTmp(a=tmp, b=data expr)`, `Store(a=addr expr, b=data expr)`,
/// `StoreG(a=guard, b=addr, c=data)`, `LoadG(a=guard, b=tmp, c=addr,
/// d=alt)`, `Cas(a=addr, b=expected, c=data, d=old tmp)`,
/// `LlSc(a=addr, b=data expr or FLAT_NONE, c=result tmp)`,
/// `Dirty(d=tmp or FLAT_NONE)`, `Exit(a=guard expr, b=dst, c=jump kind)`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FlatStmt {
    pub kind: u32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

/// A lifted block in flat form. The statement and expression pools are
/// owned by the lifter and released through [LifterOps::release].
#[repr(C)]
pub struct FlatBlock {
    pub stmts: *const FlatStmt,
    pub stmt_count: u64,
    pub exprs: *const FlatExpr,
    pub expr_count: u64,
    /// Index of the next-address expression, or [FLAT_NONE].
    pub next_expr: u64,
    pub jump_kind: u32,
}

pub const LIFT_OK: i32 = 0;
pub const LIFT_NODECODE: i32 = 1;

/// Host lifter vtable.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LifterOps {
    pub ctx: *mut c_void,
    /// Lift the block at the given address from the supplied bytes into
    /// `out`. Returns [LIFT_OK], [LIFT_NODECODE], or any other value for a
    /// general lift failure.
    pub lift: unsafe extern "C" fn(*mut c_void, u64, *const u8, u64, *mut FlatBlock) -> i32,
    /// Release the pools a successful lift placed in the block.
    pub release: unsafe extern "C" fn(*mut c_void, *mut FlatBlock),
}

struct FfiLifter {
    ops: LifterOps,
}

impl FfiLifter {
    fn rebuild_expr(block: &FlatBlock, index: u64, depth: usize) -> Option<IrExpr> {
        // Malformed pools (cycles, out-of-range indices) must not hang or
        // crash the analysis; depth is bounded by the pool size.
        if index == FLAT_NONE || index >= block.expr_count || depth > block.expr_count as usize {
            return None;
        }

        // SAFETY: index is in bounds of the lifter-owned pool.
        let expr = unsafe { &*block.exprs.add(index as usize) };
        let rebuilt = match expr.kind {
            FLAT_EXPR_CONST => IrExpr::Const {
                value: expr.a,
                size: expr.size as usize,
            },
            FLAT_EXPR_RDTMP => IrExpr::RdTmp(expr.a),
            FLAT_EXPR_GET => IrExpr::Get {
                offset: expr.a,
                size: expr.size as usize,
            },
            FLAT_EXPR_GETI => IrExpr::GetI {
                base: expr.a,
                ix: Box::new(Self::rebuild_expr(block, expr.b, depth + 1)?),
            },
            FLAT_EXPR_LOAD => IrExpr::Load {
                addr: Box::new(Self::rebuild_expr(block, expr.a, depth + 1)?),
                size: expr.size as usize,
            },
            FLAT_EXPR_UNOP => IrExpr::Unop {
                op: unop_from_raw(expr.a),
                arg: Box::new(Self::rebuild_expr(block, expr.b, depth + 1)?),
            },
            FLAT_EXPR_BINOP => IrExpr::Binop {
                op: binop_from_raw(expr.a),
                lhs: Box::new(Self::rebuild_expr(block, expr.b, depth + 1)?),
                rhs: Box::new(Self::rebuild_expr(block, expr.c, depth + 1)?),
            },
            FLAT_EXPR_ITE => IrExpr::Ite {
                cond: Box::new(Self::rebuild_expr(block, expr.a, depth + 1)?),
                if_true: Box::new(Self::rebuild_expr(block, expr.b, depth + 1)?),
                if_false: Box::new(Self::rebuild_expr(block, expr.c, depth + 1)?),
            },
            FLAT_EXPR_CCALL => {
                let mut args = Vec::with_capacity(expr.arg_count as usize);
                for i in 0..expr.arg_count {
                    // SAFETY: args has arg_count readable elements.
                    let arg_index = unsafe { *expr.args.add(i as usize) };
                    args.push(Self::rebuild_expr(block, arg_index, depth + 1)?);
                }
                IrExpr::CCall {
                    args,
                    ret_size: expr.size as usize,
                }
            }
            _ => IrExpr::Unknown,
        };

        Some(rebuilt)
    }

    fn rebuild_stmt(block: &FlatBlock, stmt: &FlatStmt) -> Option<IrStmt> {
        let expr = |index| Self::rebuild_expr(block, index, 0);

        let rebuilt = match stmt.kind {
            FLAT_STMT_IMARK => IrStmt::Imark {
                addr: stmt.a,
                len: stmt.b as usize,
            },
            FLAT_STMT_NOOP => IrStmt::NoOp,
            FLAT_STMT_ABIHINT => IrStmt::AbiHint,
            FLAT_STMT_MBE => IrStmt::Mbe,
            FLAT_STMT_PUT => IrStmt::Put {
                offset: stmt.a,
                data: expr(stmt.b)?,
            },
            FLAT_STMT_PUTI => IrStmt::PutI {
                base: stmt.a,
                ix: expr(stmt.b)?,
                data: expr(stmt.c)?,
            },
            FLAT_STMT_WRTMP => IrStmt::WrTmp {
                tmp: stmt.a,
                data: expr(stmt.b)?,
            },
            FLAT_STMT_STORE => IrStmt::Store {
                addr: expr(stmt.a)?,
                data: expr(stmt.b)?,
            },
            FLAT_STMT_STOREG => IrStmt::StoreG {
                guard: expr(stmt.a)?,
                addr: expr(stmt.b)?,
                data: expr(stmt.c)?,
            },
            FLAT_STMT_LOADG => IrStmt::LoadG {
                guard: expr(stmt.a)?,
                tmp: stmt.b,
                addr: expr(stmt.c)?,
                alt: expr(stmt.d)?,
            },
            FLAT_STMT_CAS => IrStmt::Cas {
                addr: expr(stmt.a)?,
                expected: expr(stmt.b)?,
                data: expr(stmt.c)?,
                old: stmt.d,
            },
            FLAT_STMT_LLSC => IrStmt::LlSc {
                addr: expr(stmt.a)?,
                data: if stmt.b == FLAT_NONE {
                    None
                } else {
                    Some(expr(stmt.b)?)
                },
                result: stmt.c,
            },
            FLAT_STMT_DIRTY => IrStmt::Dirty {
                args: Vec::new(),
                tmp: if stmt.d == FLAT_NONE { None } else { Some(stmt.d) },
            },
            FLAT_STMT_EXIT => IrStmt::Exit {
                guard: expr(stmt.a)?,
                dst: stmt.b,
                jump_kind: jump_kind_from_raw(stmt.c as u32),
            },
            _ => IrStmt::Unknown,
        };

        Some(rebuilt)
    }
}

impl Lifter for FfiLifter {
    fn lift(&mut self, bytes: &[u8], addr: Address) -> vex_ir::Result<IrBlock> {
        let mut flat = FlatBlock {
            stmts: std::ptr::null(),
            stmt_count: 0,
            exprs: std::ptr::null(),
            expr_count: 0,
            next_expr: FLAT_NONE,
            jump_kind: 0,
        };

        // SAFETY: bytes is a valid slice; flat is a valid out-pointer.
        let code = unsafe {
            (self.ops.lift)(self.ops.ctx, addr, bytes.as_ptr(), bytes.len() as u64, &mut flat)
        };
        match code {
            LIFT_OK => {}
            LIFT_NODECODE => return Err(vex_ir::Error::NoDecode(addr)),
            code => {
                return Err(vex_ir::Error::LiftFailed {
                    addr,
                    message: Cow::Owned(format!("lifter returned {code}")),
                })
            }
        }

        let mut stmts = Vec::with_capacity(flat.stmt_count as usize);
        let mut malformed = false;
        for i in 0..flat.stmt_count {
            // SAFETY: stmts has stmt_count readable elements.
            let stmt = unsafe { &*flat.stmts.add(i as usize) };
            match FfiLifter::rebuild_stmt(&flat, stmt) {
                Some(stmt) => stmts.push(stmt),
                None => {
                    malformed = true;
                    break;
                }
            }
        }

        let next = if malformed {
            None
        } else if flat.next_expr == FLAT_NONE {
            Some(IrExpr::Const { value: 0, size: 8 })
        } else {
            FfiLifter::rebuild_expr(&flat, flat.next_expr, 0)
        };
        let jump_kind = jump_kind_from_raw(flat.jump_kind);

        // SAFETY: flat was filled by a successful lift call.
        unsafe { (self.ops.release)(self.ops.ctx, &mut flat) };

        match next {
            Some(next) if !malformed => Ok(IrBlock {
                stmts,
                next,
                jump_kind,
            }),
            _ => Err(vex_ir::Error::LiftFailed {
                addr,
                message: Cow::Borrowed("malformed flat block"),
            }),
        }
    }
}

fn unop_from_raw(raw: u64) -> UnOp {
    match raw {
        0 => UnOp::Not,
        1 => UnOp::Negate,
        2 => UnOp::ZeroExtend,
        3 => UnOp::SignExtend,
        4 => UnOp::Narrow,
        _ => UnOp::CountLeadingZeros,
    }
}

fn binop_from_raw(raw: u64) -> BinOp {
    match raw {
        0 => BinOp::Add,
        1 => BinOp::Subtract,
        2 => BinOp::Multiply,
        3 => BinOp::UnsignedDivide,
        4 => BinOp::SignedDivide,
        5 => BinOp::And,
        6 => BinOp::Or,
        7 => BinOp::Xor,
        8 => BinOp::ShiftLeft,
        9 => BinOp::UnsignedShiftRight,
        10 => BinOp::SignedShiftRight,
        11 => BinOp::CmpEqual,
        12 => BinOp::CmpNotEqual,
        13 => BinOp::CmpUnsignedLessThan,
        14 => BinOp::CmpSignedLessThan,
        15 => BinOp::CmpUnsignedLessOrEqual,
        _ => BinOp::CmpSignedLessOrEqual,
    }
}

fn jump_kind_from_raw(raw: u32) -> JumpKind {
    match raw {
        0 => JumpKind::Boring,
        1 => JumpKind::Call,
        2 => JumpKind::Ret,
        3 => JumpKind::Syscall,
        _ => JumpKind::NoDecode,
    }
}

fn arch_from_raw(raw: u32) -> GuestArch {
    match raw {
        0 => GuestArch::X86,
        1 => GuestArch::Amd64,
        2 => GuestArch::Arm,
        3 => GuestArch::Arm64,
        4 => GuestArch::Mips32,
        _ => GuestArch::Mips64,
    }
}

// -- flattened results ------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CStopDetails {
    pub stop_reason: u32,
    pub block_addr: u64,
    pub block_size: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CMemoryValue {
    pub address: u64,
    pub value: [u8; MAX_MEM_ACCESS_SIZE],
    pub size: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CInstrDetails {
    pub instr_addr: u64,
    pub has_memory_dep: u8,
    pub memory_value: CMemoryValue,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CRegisterValue {
    pub offset: u64,
    pub value: [u8; MAX_REGISTER_BYTE_SIZE],
}

/// Flattened block details for the host; the instruction and register
/// arrays stay owned by the handle and are valid until the next call that
/// mutates it.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CBlockDetails {
    pub block_addr: u64,
    pub block_size: u64,
    pub symbolic_instrs: *const CInstrDetails,
    pub symbolic_instrs_count: u64,
    pub register_values: *const CRegisterValue,
    pub register_values_count: u64,
}

/// Node of the dirty-memory list returned by [ct_sync]; the caller
/// destroys the list with [ct_destroy_mem_updates].
#[repr(C)]
pub struct CMemUpdate {
    pub address: u64,
    pub length: u64,
    pub next: *mut CMemUpdate,
}

#[repr(C)]
pub struct CTransmitRecord {
    pub data: *const u8,
    pub count: u32,
}

/// The handle `ct_alloc` returns: the core plus the host vtable and the
/// buffers backing pointers handed across the boundary.
pub struct FfiState {
    core: State,
    engine_ops: EngineOps,
    details_instrs: Vec<Vec<CInstrDetails>>,
    details_regs: Vec<Vec<CRegisterValue>>,
    symbolic_reg_buf: Vec<u64>,
    transmit_buf: Vec<u8>,
    transmit_record: CTransmitRecord,
}

impl FfiState {
    fn ctx(&self) -> FfiEngine {
        FfiEngine {
            ops: self.engine_ops,
        }
    }
}

unsafe fn state<'a>(handle: *mut FfiState) -> &'a mut FfiState {
    debug_assert!(!handle.is_null());
    &mut *handle
}

// -- lifecycle --------------------------------------------------------------

/// Construct a state bound to the host engine `ops`, sharing code pages
/// with every state allocated under `cache_key`.
///
/// # Safety
/// `ops` must point to a fully populated vtable whose function pointers
/// stay valid until `ct_dealloc`.
#[no_mangle]
pub unsafe extern "C" fn ct_alloc(ops: *const EngineOps, cache_key: u64) -> *mut FfiState {
    let engine_ops = *ops;
    let core = State::new(Box::new(FfiEngine { ops: engine_ops }), cache_key);
    Box::into_raw(Box::new(FfiState {
        core,
        engine_ops,
        details_instrs: Vec::new(),
        details_regs: Vec::new(),
        symbolic_reg_buf: Vec::new(),
        transmit_buf: Vec::new(),
        transmit_record: CTransmitRecord {
            data: std::ptr::null(),
            count: 0,
        },
    }))
}

/// Release the state. Does not free the host engine.
///
/// # Safety
/// `handle` must originate from [ct_alloc] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn ct_dealloc(handle: *mut FfiState) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

#[no_mangle]
pub unsafe extern "C" fn ct_hook(handle: *mut FfiState) {
    state(handle).core.hook();
}

#[no_mangle]
pub unsafe extern "C" fn ct_unhook(handle: *mut FfiState) {
    state(handle).core.unhook();
}

/// Run up to `steps` blocks from `pc`. Returns the engine status code.
#[no_mangle]
pub unsafe extern "C" fn ct_start(handle: *mut FfiState, pc: u64, steps: u64) -> i32 {
    use crate::engine::Error;
    match state(handle).core.start(pc, steps) {
        Ok(()) => ENGINE_OK,
        Err(Error::ReadUnmapped(_)) => ENGINE_ERR_READ_UNMAPPED,
        Err(Error::WriteUnmapped(_)) => ENGINE_ERR_WRITE_UNMAPPED,
        Err(Error::FetchUnmapped(_)) => ENGINE_ERR_FETCH_UNMAPPED,
        Err(Error::Protection(_)) => ENGINE_ERR_PROTECTION,
        Err(Error::InvalidInstruction) => ENGINE_ERR_INSN_INVALID,
        Err(Error::DivisionByZero) => ENGINE_ERR_ZERO_DIV,
        Err(Error::Halted) => ENGINE_ERR_HALT,
        Err(Error::InvalidArgument(_)) => -1,
        Err(Error::Failure(code)) => code,
    }
}

#[no_mangle]
pub unsafe extern "C" fn ct_stop(handle: *mut FfiState, reason: u32) {
    let state = state(handle);
    let reason = stop_reason_from_raw(reason);
    let mut ctx = state.ctx();
    state.core.stop_with(&mut ctx, reason);
}

fn stop_reason_from_raw(raw: u32) -> StopReason {
    // Stop reasons have stable ordinals; anything out of range is an
    // unclassified error.
    if raw <= StopReason::UnknownMemoryRead as u32 {
        // SAFETY: StopReason is repr(u32) with contiguous discriminants.
        unsafe { std::mem::transmute::<u32, StopReason>(raw) }
    } else {
        StopReason::Error
    }
}

#[no_mangle]
pub unsafe extern "C" fn ct_get_stop_details(handle: *mut FfiState) -> CStopDetails {
    let details = state(handle).core.stop_details();
    CStopDetails {
        stop_reason: details.reason as u32,
        block_addr: details.block_addr,
        block_size: details.block_size,
    }
}

// -- engine callbacks -------------------------------------------------------

/// Deliver the engine's basic-block callback. Returns 0 to continue, 1
/// when a stop has been requested.
///
/// # Safety
/// Must be called synchronously from the engine run started by [ct_start].
#[no_mangle]
pub unsafe extern "C" fn ct_hook_block(handle: *mut FfiState, addr: u64, size: u32) -> i32 {
    let state = state(handle);
    let mut ctx = state.ctx();
    state.core.on_block(&mut ctx, addr, size).is_stop() as i32
}

/// Deliver a post-read memory callback with the value read.
#[no_mangle]
pub unsafe extern "C" fn ct_hook_mem_read(
    handle: *mut FfiState,
    addr: u64,
    value: *const u8,
    size: u64,
) -> i32 {
    let state = state(handle);
    let value = std::slice::from_raw_parts(value, size as usize);
    let mut ctx = state.ctx();
    state.core.on_mem_read(&mut ctx, addr, value).is_stop() as i32
}

/// Deliver a pre-write memory callback with the value about to land.
#[no_mangle]
pub unsafe extern "C" fn ct_hook_mem_write(
    handle: *mut FfiState,
    addr: u64,
    value: *const u8,
    size: u64,
) -> i32 {
    let state = state(handle);
    let value = std::slice::from_raw_parts(value, size as usize);
    let mut ctx = state.ctx();
    state.core.on_mem_write(&mut ctx, addr, value).is_stop() as i32
}

/// Deliver an unmapped-access fault. `kind`: 0 read, 1 write, 2 fetch.
/// Returns 1 when the fault was repaired and the access should retry.
#[no_mangle]
pub unsafe extern "C" fn ct_hook_unmapped(
    handle: *mut FfiState,
    kind: u32,
    addr: u64,
    size: u64,
) -> i32 {
    let state = state(handle);
    let mut ctx = state.ctx();
    state
        .core
        .on_unmapped(&mut ctx, access_kind_from_raw(kind), addr, size as usize) as i32
}

/// Deliver a protection fault. Same conventions as [ct_hook_unmapped].
#[no_mangle]
pub unsafe extern "C" fn ct_hook_protection(
    handle: *mut FfiState,
    kind: u32,
    addr: u64,
    size: u64,
) -> i32 {
    let state = state(handle);
    let mut ctx = state.ctx();
    state
        .core
        .on_protection_fault(&mut ctx, access_kind_from_raw(kind), addr, size as usize)
        as i32
}

/// Deliver an interrupt. Returns 0 to continue, 1 when stopped.
#[no_mangle]
pub unsafe extern "C" fn ct_hook_interrupt(handle: *mut FfiState, intno: u32) -> i32 {
    let state = state(handle);
    let mut ctx = state.ctx();
    state.core.on_interrupt(&mut ctx, intno).is_stop() as i32
}

fn access_kind_from_raw(raw: u32) -> AccessKind {
    match raw {
        0 => AccessKind::Read,
        1 => AccessKind::Write,
        _ => AccessKind::Fetch,
    }
}

// -- run inspection ---------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_bbl_addrs(handle: *mut FfiState) -> *const u64 {
    state(handle).core.bbl_addrs().as_ptr()
}

#[no_mangle]
pub unsafe extern "C" fn ct_bbl_addr_count(handle: *mut FfiState) -> u64 {
    state(handle).core.bbl_addrs().len() as u64
}

#[no_mangle]
pub unsafe extern "C" fn ct_stack_pointers(handle: *mut FfiState) -> *const u64 {
    state(handle).core.stack_pointers().as_ptr()
}

#[no_mangle]
pub unsafe extern "C" fn ct_stack_pointer_count(handle: *mut FfiState) -> u64 {
    state(handle).core.stack_pointers().len() as u64
}

/// Blocks executed in the current or last run.
#[no_mangle]
pub unsafe extern "C" fn ct_step_count(handle: *mut FfiState) -> u64 {
    state(handle).core.step_count()
}

#[no_mangle]
pub unsafe extern "C" fn ct_syscall_count(handle: *mut FfiState) -> u64 {
    state(handle).core.syscall_count()
}

/// One executed page base per call, in descending activation order;
/// returns [FLAT_NONE] when exhausted.
#[no_mangle]
pub unsafe extern "C" fn ct_executed_pages(handle: *mut FfiState) -> u64 {
    state(handle).core.next_executed_page().unwrap_or(FLAT_NONE)
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_tracking(handle: *mut FfiState, track_bbls: u8, track_stack: u8) {
    state(handle).core.set_tracking(track_bbls != 0, track_stack != 0);
}

/// Replace the breakpoint set with `count` addresses at `stops`.
#[no_mangle]
pub unsafe extern "C" fn ct_set_stops(handle: *mut FfiState, count: u64, stops: *const u64) {
    let stops = std::slice::from_raw_parts(stops, count as usize);
    state(handle).core.set_stops(stops.iter().copied());
}

// -- shadow memory ----------------------------------------------------------

/// Activate shadow pages over `[addr, addr + length)`, seeding taint from
/// `taint` when non-null (one byte per guest byte, non-zero = symbolic).
#[no_mangle]
pub unsafe extern "C" fn ct_activate_page(
    handle: *mut FfiState,
    addr: u64,
    length: u64,
    taint: *const u8,
) {
    let taint = if taint.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(taint, length as usize))
    };
    state(handle).core.activate_page(addr, length, taint);
}

/// Return the dirty+symbolic memory runs as a linked list; destroy with
/// [ct_destroy_mem_updates].
#[no_mangle]
pub unsafe extern "C" fn ct_sync(handle: *mut FfiState) -> *mut CMemUpdate {
    let mut head: *mut CMemUpdate = std::ptr::null_mut();
    for update in state(handle).core.sync().into_iter().rev() {
        head = Box::into_raw(Box::new(CMemUpdate {
            address: update.address,
            length: update.length,
            next: head,
        }));
    }
    head
}

/// # Safety
/// `head` must be a list returned by [ct_sync], destroyed exactly once.
#[no_mangle]
pub unsafe extern "C" fn ct_destroy_mem_updates(head: *mut CMemUpdate) {
    let mut node = head;
    while !node.is_null() {
        let boxed = Box::from_raw(node);
        node = boxed.next;
    }
}

// -- symbolic registers -----------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_symbolic_register_data(
    handle: *mut FfiState,
    count: u64,
    offsets: *const u64,
) {
    let offsets = std::slice::from_raw_parts(offsets, count as usize);
    state(handle).core.symbolic_register_data(offsets.iter().copied());
}

/// Write the symbolic register offsets into `output` (which must have room
/// for them) and return how many were written.
#[no_mangle]
pub unsafe extern "C" fn ct_get_symbolic_registers(
    handle: *mut FfiState,
    output: *mut u64,
) -> u64 {
    let state = state(handle);
    state.symbolic_reg_buf = state.core.get_symbolic_registers();
    let count = state.symbolic_reg_buf.len();
    std::ptr::copy_nonoverlapping(state.symbolic_reg_buf.as_ptr(), output, count);
    count as u64
}

/// Enable symbolic register tracking with the host lifter `lifter_ops`.
/// `arch`: 0 x86, 1 amd64, 2 arm, 3 arm64, 4 mips32, 5 mips64.
///
/// # Safety
/// `lifter_ops` must point to a populated vtable valid until tracking is
/// disabled or the state deallocated.
#[no_mangle]
pub unsafe extern "C" fn ct_enable_symbolic_reg_tracking(
    handle: *mut FfiState,
    arch: u32,
    bits: u32,
    big_endian: u8,
    lifter_ops: *const LifterOps,
) {
    let archinfo = ArchInfo::new(
        bits,
        if big_endian != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        },
    );
    let lifter = Box::new(FfiLifter { ops: *lifter_ops });
    state(handle)
        .core
        .enable_symbolic_tracking(arch_from_raw(arch), archinfo, lifter);
}

#[no_mangle]
pub unsafe extern "C" fn ct_disable_symbolic_reg_tracking(handle: *mut FfiState) {
    state(handle).core.disable_symbolic_tracking();
}

// -- register configuration -------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_set_artificial_registers(
    handle: *mut FfiState,
    offsets: *const u64,
    count: u64,
) {
    let offsets = std::slice::from_raw_parts(offsets, count as usize);
    state(handle).core.regs_mut().set_artificial(offsets.iter().copied());
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_register_size_mapping(
    handle: *mut FfiState,
    offsets: *const u64,
    sizes: *const u64,
    count: u64,
) {
    let offsets = std::slice::from_raw_parts(offsets, count as usize);
    let sizes = std::slice::from_raw_parts(sizes, count as usize);
    state(handle).core.regs_mut().set_sizes(
        offsets
            .iter()
            .zip(sizes)
            .map(|(&offset, &size)| (offset, size as usize)),
    );
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_engine_reg_mappings(
    handle: *mut FfiState,
    offsets: *const u64,
    engine_ids: *const u64,
    count: u64,
) {
    let offsets = std::slice::from_raw_parts(offsets, count as usize);
    let engine_ids = std::slice::from_raw_parts(engine_ids, count as usize);
    state(handle)
        .core
        .regs_mut()
        .set_engine_mappings(offsets.iter().copied().zip(engine_ids.iter().copied()));
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_sub_reg_mappings(
    handle: *mut FfiState,
    sub_offsets: *const u64,
    full_offsets: *const u64,
    count: u64,
) {
    let sub_offsets = std::slice::from_raw_parts(sub_offsets, count as usize);
    let full_offsets = std::slice::from_raw_parts(full_offsets, count as usize);
    state(handle)
        .core
        .regs_mut()
        .set_sub_reg_mappings(sub_offsets.iter().copied().zip(full_offsets.iter().copied()));
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_cpu_flags_details(
    handle: *mut FfiState,
    flag_offsets: *const u64,
    bitmasks: *const u64,
    count: u64,
) {
    let flag_offsets = std::slice::from_raw_parts(flag_offsets, count as usize);
    let bitmasks = std::slice::from_raw_parts(bitmasks, count as usize);
    state(handle)
        .core
        .regs_mut()
        .set_cpu_flags(flag_offsets.iter().copied().zip(bitmasks.iter().copied()));
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_flags_register_id(handle: *mut FfiState, reg: i64) {
    let reg = if reg < 0 { None } else { Some(reg as u64) };
    state(handle).core.regs_mut().set_flags_reg(reg);
}

#[no_mangle]
pub unsafe extern "C" fn ct_set_register_blacklist(
    handle: *mut FfiState,
    offsets: *const u64,
    count: u64,
) {
    let offsets = std::slice::from_raw_parts(offsets, count as usize);
    state(handle).core.regs_mut().set_blacklist(offsets.iter().copied());
}

/// Identify the program counter: its lifter offset and engine register id.
#[no_mangle]
pub unsafe extern "C" fn ct_set_pc_register(handle: *mut FfiState, offset: u64, engine_reg: u64) {
    state(handle).core.regs_mut().set_pc(offset, engine_reg);
}

/// Identify the stack pointer's engine register id, for trace collection.
#[no_mangle]
pub unsafe extern "C" fn ct_set_sp_register(handle: *mut FfiState, engine_reg: i64) {
    let reg = if engine_reg < 0 {
        None
    } else {
        Some(engine_reg as u64)
    };
    state(handle).core.regs_mut().set_sp_reg(reg);
}

// -- page cache -------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_cache_page(
    handle: *mut FfiState,
    addr: u64,
    length: u64,
    bytes: *const u8,
    permissions: u64,
) -> u8 {
    let bytes = std::slice::from_raw_parts(bytes, length as usize);
    let perms = PagePerms::from_bits_truncate(permissions);
    state(handle).core.cache_page(addr, bytes, perms) as u8
}

#[no_mangle]
pub unsafe extern "C" fn ct_uncache_pages_touching_region(
    handle: *mut FfiState,
    addr: u64,
    length: u64,
) {
    state(handle).core.uncache_pages_touching_region(addr, length);
}

#[no_mangle]
pub unsafe extern "C" fn ct_clear_page_cache(handle: *mut FfiState) {
    state(handle).core.clear_page_cache();
}

#[no_mangle]
pub unsafe extern "C" fn ct_in_cache(handle: *mut FfiState, addr: u64) -> u8 {
    state(handle).core.in_cache(addr) as u8
}

// -- re-execution details ---------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_get_count_of_blocks_with_symbolic_instrs(
    handle: *mut FfiState,
) -> u64 {
    state(handle).core.blocks_with_symbolic_instrs().len() as u64
}

/// Fill `out` (one element per recorded block) with flattened block
/// details. The arrays behind the pointers stay valid until the next call
/// to this function or `ct_dealloc`.
#[no_mangle]
pub unsafe extern "C" fn ct_get_details_of_blocks_with_symbolic_instrs(
    handle: *mut FfiState,
    out: *mut CBlockDetails,
) {
    let state = state(handle);
    state.details_instrs.clear();
    state.details_regs.clear();

    let blocks = state.core.blocks_with_symbolic_instrs();
    for block in blocks {
        let instrs: Vec<CInstrDetails> = block
            .symbolic_instrs
            .iter()
            .map(|instr| CInstrDetails {
                instr_addr: instr.instr_addr,
                has_memory_dep: instr.has_memory_dep as u8,
                memory_value: CMemoryValue {
                    address: instr.memory_value.address,
                    value: instr.memory_value.value,
                    size: instr.memory_value.size,
                },
            })
            .collect();
        let regs: Vec<CRegisterValue> = block
            .register_values
            .iter()
            .map(|reg| CRegisterValue {
                offset: reg.offset,
                value: reg.value,
            })
            .collect();
        state.details_instrs.push(instrs);
        state.details_regs.push(regs);
    }

    for (i, block) in blocks.iter().enumerate() {
        let instrs = &state.details_instrs[i];
        let regs = &state.details_regs[i];
        *out.add(i) = CBlockDetails {
            block_addr: block.block_addr,
            block_size: block.block_size,
            symbolic_instrs: instrs.as_ptr(),
            symbolic_instrs_count: instrs.len() as u64,
            register_values: regs.as_ptr(),
            register_values_count: regs.len() as u64,
        };
    }
}

// -- concrete transmits -----------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ct_is_interrupt_handled(handle: *mut FfiState) -> u8 {
    state(handle).core.is_interrupt_handled() as u8
}

/// Bind the transmit descriptor: syscall number, the block it may fire in
/// (0 for anywhere) and the engine registers holding the number, buffer
/// pointer and byte count.
#[no_mangle]
pub unsafe extern "C" fn ct_set_transmit_sysno(
    handle: *mut FfiState,
    sysno: u64,
    bbl_addr: u64,
    num_reg: u64,
    buf_reg: u64,
    count_reg: u64,
) {
    state(handle)
        .core
        .set_transmit_descriptor(Some(TransmitDescriptor {
            sysno,
            bbl_addr,
            num_reg,
            buf_reg,
            count_reg,
        }));
}

/// Pop the next captured transmit record, or null when none remain. The
/// returned pointer is valid until the next call.
#[no_mangle]
pub unsafe extern "C" fn ct_process_transmit(handle: *mut FfiState) -> *const CTransmitRecord {
    let state = state(handle);
    let mut records = state.core.process_transmit(1);
    let Some(record) = records.pop() else {
        return std::ptr::null();
    };

    state.transmit_buf = record.data;
    state.transmit_record = CTransmitRecord {
        data: state.transmit_buf.as_ptr(),
        count: record.count,
    };
    &state.transmit_record
}
