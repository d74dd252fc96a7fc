use bitflags::bitflags;

/// Result returned by engine APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// A register identifier in the engine's own numbering. Opaque to this
/// crate; hosts establish the lifter-offset mapping through
/// [crate::regs::RegisterInfo].
pub type EngineRegId = u64;

/// Errors the engine reports. Unclassified conditions surface as
/// [Error::Failure] with the engine's own code.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("read of unmapped memory at {0:#x}")]
    ReadUnmapped(u64),

    #[error("write to unmapped memory at {0:#x}")]
    WriteUnmapped(u64),

    #[error("instruction fetch from unmapped memory at {0:#x}")]
    FetchUnmapped(u64),

    #[error("memory protection violation at {0:#x}")]
    Protection(u64),

    #[error("invalid instruction")]
    InvalidInstruction,

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("guest halted")]
    Halted,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("engine failure (code {0})")]
    Failure(i32),
}

bitflags! {
    /// Protection bits of a guest page.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PagePerms: u64 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl Default for PagePerms {
    fn default() -> Self {
        PagePerms::READ | PagePerms::WRITE
    }
}

/// Kind of access that triggered a fault hook.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

/// What a hook tells the engine to do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HookAction {
    /// Keep executing.
    #[default]
    Continue,

    /// Halt as soon as possible; the driver has recorded why.
    Stop,
}

impl HookAction {
    pub fn is_stop(self) -> bool {
        self == HookAction::Stop
    }
}

/// Synchronous services of the engine available to the driver both between
/// runs and from inside a hook. The engine passes itself to every hook
/// invocation; hooks must not start a nested run through this handle.
pub trait EngineContext {
    /// Read a register into `out`; `out.len()` selects the width.
    fn reg_read(&mut self, reg: EngineRegId, out: &mut [u8]) -> Result<()>;

    /// Write a register from `data`.
    fn reg_write(&mut self, reg: EngineRegId, data: &[u8]) -> Result<()>;

    /// Read guest memory into `out`.
    fn mem_read(&mut self, addr: u64, out: &mut [u8]) -> Result<()>;

    /// Write guest memory from `data`.
    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Map a page-aligned region with the given protection.
    fn mem_map(&mut self, addr: u64, size: usize, perms: PagePerms) -> Result<()>;

    /// Ask the engine to halt the current run once the active hook
    /// returns. A no-op outside a run.
    fn request_stop(&mut self);
}

/// Callback surface the driver implements. The engine invokes these
/// synchronously on its own thread during [Engine::run]; treat them as
/// handlers on a single-threaded event loop.
pub trait EngineHooks {
    /// A new basic block is about to execute.
    fn on_block(&mut self, ctx: &mut dyn EngineContext, addr: u64, size: u32) -> HookAction;

    /// An instruction read `value.len()` bytes at `addr`. Fired after the
    /// read completed, with the concrete value read.
    fn on_mem_read(&mut self, ctx: &mut dyn EngineContext, addr: u64, value: &[u8]) -> HookAction;

    /// An instruction is writing `value.len()` bytes to `addr`. Fired
    /// before the write lands.
    fn on_mem_write(&mut self, ctx: &mut dyn EngineContext, addr: u64, value: &[u8]) -> HookAction;

    /// An access faulted on unmapped memory. Return `true` when the fault
    /// was repaired and the access should be retried.
    fn on_unmapped(
        &mut self,
        ctx: &mut dyn EngineContext,
        kind: AccessKind,
        addr: u64,
        size: usize,
    ) -> bool;

    /// An access violated page protections. Return `true` to retry.
    fn on_protection_fault(
        &mut self,
        ctx: &mut dyn EngineContext,
        kind: AccessKind,
        addr: u64,
        size: usize,
    ) -> bool;

    /// The guest raised interrupt `intno`.
    fn on_interrupt(&mut self, ctx: &mut dyn EngineContext, intno: u32) -> HookAction;
}

/// The external CPU emulator.
///
/// [Engine::run] executes from `pc` until the guest halts, a fault is left
/// unrepaired, or a hook requests a stop; hooks are delivered to `hooks`
/// throughout the run. Implementations that receive their callbacks
/// out-of-band (for example through an FFI layer that routes host engine
/// callbacks directly at the driver) may ignore `hooks`.
pub trait Engine: EngineContext {
    fn run(&mut self, pc: u64, hooks: &mut dyn EngineHooks) -> Result<()>;
}
