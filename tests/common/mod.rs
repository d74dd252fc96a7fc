//! Synthetic engine and lifter fixtures for driving the core end to end.
//!
//! `TestEngine` replays a scripted trace of blocks and memory events while
//! honoring the driver's stop requests; `TestLifter` serves pre-built IR
//! blocks from a table. Together they stand in for the real emulator and
//! lifter without any decoding.

use std::collections::{BTreeMap, HashMap};

use concolic_taint::engine::{
    AccessKind, Engine, EngineContext, EngineHooks, EngineRegId, Error as EngineError, PagePerms,
    Result as EngineResult,
};
use concolic_taint::State;
use vex_ir::{Address, ArchInfo, Endianness, GuestArch, IrBlock, IrExpr, IrStmt, JumpKind, Lifter};

/// Lifter offset of the program counter in the test register file.
pub const PC_OFFSET: u64 = 184;
/// Engine register id of the program counter.
pub const PC_ENGINE_REG: EngineRegId = 100;
/// Engine register id of the stack pointer.
pub const SP_ENGINE_REG: EngineRegId = 101;

/// One event the engine performs while "executing" a block.
#[derive(Debug, Clone)]
pub enum Event {
    /// Read `size` bytes at `addr` from engine memory.
    Read { addr: u64, size: usize },

    /// Write `bytes` to `addr`.
    Write { addr: u64, bytes: Vec<u8> },

    /// Raise interrupt `intno`.
    Interrupt { intno: u32 },
}

/// One block of the scripted trace.
#[derive(Debug, Clone)]
pub struct ScriptedBlock {
    pub addr: Address,
    pub size: u32,
    pub events: Vec<Event>,
}

impl ScriptedBlock {
    pub fn new(addr: Address, size: u32) -> Self {
        Self {
            addr,
            size,
            events: Vec::new(),
        }
    }

    pub fn with_events(addr: Address, size: u32, events: Vec<Event>) -> Self {
        Self { addr, size, events }
    }
}

/// A scripted engine: a register file, flat byte memory and a trace of
/// blocks to replay through the hook surface.
#[derive(Default)]
pub struct TestEngine {
    pub regs: BTreeMap<EngineRegId, [u8; 32]>,
    pub memory: BTreeMap<u64, u8>,
    pub script: Vec<ScriptedBlock>,
    pub mapped: Vec<(u64, usize)>,
    stop_requested: bool,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reg_u64(&mut self, reg: EngineRegId, value: u64) {
        let mut buf = [0u8; 32];
        buf[..8].copy_from_slice(&value.to_le_bytes());
        self.regs.insert(reg, buf);
    }

    pub fn write_memory(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, byte);
        }
    }
}

impl EngineContext for TestEngine {
    fn reg_read(&mut self, reg: EngineRegId, out: &mut [u8]) -> EngineResult<()> {
        let value = self.regs.entry(reg).or_insert([0u8; 32]);
        let len = out.len().min(value.len());
        out[..len].copy_from_slice(&value[..len]);
        Ok(())
    }

    fn reg_write(&mut self, reg: EngineRegId, data: &[u8]) -> EngineResult<()> {
        let value = self.regs.entry(reg).or_insert([0u8; 32]);
        let len = data.len().min(value.len());
        value[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn mem_read(&mut self, addr: u64, out: &mut [u8]) -> EngineResult<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = *self
                .memory
                .get(&(addr + i as u64))
                .ok_or(EngineError::ReadUnmapped(addr + i as u64))?;
        }
        Ok(())
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> EngineResult<()> {
        for (i, &byte) in data.iter().enumerate() {
            self.memory.insert(addr + i as u64, byte);
        }
        Ok(())
    }

    fn mem_map(&mut self, addr: u64, size: usize, _perms: PagePerms) -> EngineResult<()> {
        self.mapped.push((addr, size));
        Ok(())
    }

    fn request_stop(&mut self) {
        self.stop_requested = true;
    }
}

impl Engine for TestEngine {
    fn run(&mut self, pc: u64, hooks: &mut dyn EngineHooks) -> EngineResult<()> {
        self.stop_requested = false;

        let start = self
            .script
            .iter()
            .position(|block| block.addr == pc)
            .unwrap_or(0);

        for index in start..self.script.len() {
            let block = self.script[index].clone();

            if hooks.on_block(self, block.addr, block.size).is_stop() || self.stop_requested {
                return Ok(());
            }

            for event in &block.events {
                let stop = match event {
                    Event::Read { addr, size } => {
                        let mut value = vec![0u8; *size];
                        match self.mem_read(*addr, &mut value) {
                            Ok(()) => hooks.on_mem_read(self, *addr, &value).is_stop(),
                            Err(_) => {
                                if hooks.on_unmapped(self, AccessKind::Read, *addr, *size) {
                                    // Repaired; retry once.
                                    self.mem_read(*addr, &mut value)?;
                                    hooks.on_mem_read(self, *addr, &value).is_stop()
                                } else {
                                    return Err(EngineError::ReadUnmapped(*addr));
                                }
                            }
                        }
                    }
                    Event::Write { addr, bytes } => {
                        let stop = hooks.on_mem_write(self, *addr, bytes).is_stop();
                        if !stop && !self.stop_requested {
                            self.mem_write(*addr, bytes)?;
                        }
                        stop
                    }
                    Event::Interrupt { intno } => hooks.on_interrupt(self, *intno).is_stop(),
                };

                if stop || self.stop_requested {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// A lifter serving pre-built blocks from a table.
#[derive(Default)]
pub struct TestLifter {
    blocks: HashMap<Address, IrBlock>,
    fail_at: HashMap<Address, vex_ir::Error>,
}

impl TestLifter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: Address, block: IrBlock) -> &mut Self {
        self.blocks.insert(addr, block);
        self
    }

    pub fn fail_at(&mut self, addr: Address, error: vex_ir::Error) -> &mut Self {
        self.fail_at.insert(addr, error);
        self
    }
}

impl Lifter for TestLifter {
    fn lift(&mut self, _bytes: &[u8], addr: Address) -> vex_ir::Result<IrBlock> {
        if let Some(error) = self.fail_at.remove(&addr) {
            return Err(error);
        }
        self.blocks
            .get(&addr)
            .cloned()
            .ok_or(vex_ir::Error::LiftFailed {
                addr,
                message: std::borrow::Cow::Borrowed("no block scripted at address"),
            })
    }
}

/// A straight-line block falling through to `next_addr`.
pub fn boring_block(stmts: Vec<IrStmt>, next_addr: Address) -> IrBlock {
    IrBlock {
        stmts,
        next: IrExpr::Const {
            value: next_addr,
            size: 8,
        },
        jump_kind: JumpKind::Boring,
    }
}

/// Build a state over the scripted engine with the standard test register
/// file: offsets 16, 24, .. 80 map to engine registers 1..=9, all 8 bytes
/// wide; offset 17 is a sub-register of 16, offset 48 is blacklisted and
/// offset 200 artificial.
pub fn test_state(mut engine: TestEngine, lifter: TestLifter) -> State {
    // Back every scripted block with bytes so the driver can read them
    // for lifting.
    let blocks: Vec<(Address, u32)> = engine
        .script
        .iter()
        .map(|block| (block.addr, block.size))
        .collect();
    for (addr, size) in blocks {
        engine.write_memory(addr, &vec![0x90u8; size as usize]);
    }

    let mut state = State::new(Box::new(engine), 0x77);

    let regs = state.regs_mut();
    regs.set_engine_mappings((0..9u64).map(|i| (16 + i * 8, i + 1)));
    regs.set_sizes((0..9u64).map(|i| (16 + i * 8, 8)));
    regs.set_sub_reg_mappings([(17, 16)]);
    regs.set_blacklist([48]);
    regs.set_artificial([200]);
    regs.set_pc(PC_OFFSET, PC_ENGINE_REG);
    regs.set_sp_reg(Some(SP_ENGINE_REG));

    state.enable_symbolic_tracking(
        GuestArch::Amd64,
        ArchInfo::new(64, Endianness::Little),
        Box::new(lifter),
    );
    state.hook();
    state
}
