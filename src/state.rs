use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use vex_ir::{Address, ArchInfo, GuestArch, Lifter, RegOffset, TempId};

use crate::analyzer::analyze_block;
use crate::block::{BlockDetails, MemReadResult, RegisterValue, TransmitRecord};
use crate::cache::{registry, BlockTaintCache, PageCache};
use crate::engine::{
    AccessKind, Engine, EngineContext, EngineRegId, EngineHooks, HookAction, PagePerms,
};
use crate::regs::RegisterInfo;
use crate::shadow::{MemUpdate, ShadowMemory, WriteLog};
use crate::slice::InstrSliceDetails;
use crate::stop::{StopDetails, StopReason};
use crate::taint::BlockTaintEntry;
use crate::{block::InstrDetails, page_base, MAX_MEM_ACCESS_SIZE, PAGE_SIZE};

/// Binding of an analysis-specific transmit syscall: when the guest raises
/// a syscall whose number register holds `sysno` (inside `bbl_addr` when
/// non-zero), the driver captures the transmitted bytes instead of
/// stopping.
///
/// The register bindings travel with the descriptor because engine
/// register ids are host-assigned; the core cannot hardcode them per
/// architecture.
#[derive(Debug, Copy, Clone)]
pub struct TransmitDescriptor {
    pub sysno: u64,
    pub bbl_addr: Address,
    pub num_reg: EngineRegId,
    pub buf_reg: EngineRegId,
    pub count_reg: EngineRegId,
}

/// One engine instance being driven concretely under taint tracking.
///
/// A `State` is owned and driven by exactly one host thread; the engine's
/// callbacks arrive synchronously on that thread through [EngineHooks].
pub struct State {
    /// The engine. Taken out for the duration of [State::start] so the
    /// driver itself can serve as the hook sink; hooks reach the engine
    /// through the context passed to each callback.
    engine: Option<Box<dyn Engine>>,

    cache_key: u64,
    page_cache: Arc<Mutex<PageCache>>,
    block_taint_cache: BlockTaintCache,
    hooked: bool,

    lifter: Option<Box<dyn Lifter>>,
    guest_arch: Option<(GuestArch, ArchInfo)>,
    pub(crate) regs: RegisterInfo,

    pub(crate) shadow: ShadowMemory,
    pub(crate) write_log: WriteLog,

    stop_points: BTreeSet<Address>,
    stopped: bool,
    stop_details: StopDetails,

    cur_steps: u64,
    max_steps: u64,
    cur_block_addr: Address,
    cur_block_size: u32,

    track_bbls: bool,
    track_stack: bool,
    bbl_addrs: Vec<Address>,
    stack_pointers: Vec<u64>,
    executed_pages: BTreeSet<Address>,
    executed_pages_drain: Option<Vec<Address>>,

    syscall_count: u64,
    interrupt_handled: bool,
    transmit: Option<TransmitDescriptor>,
    transmit_records: Vec<TransmitRecord>,

    // Taint propagation state for the in-flight block.
    pub(crate) symbolic_registers: HashSet<RegOffset>,
    pub(crate) block_symbolic_registers: HashSet<RegOffset>,
    pub(crate) block_concrete_registers: HashSet<RegOffset>,
    pub(crate) block_symbolic_temps: HashSet<TempId>,
    pub(crate) cur_block_entry: Option<Arc<BlockTaintEntry>>,
    pub(crate) taint_cursor: Option<Address>,
    pub(crate) mem_read_parked_at: Option<Address>,
    pub(crate) mem_reads_map: HashMap<Address, MemReadResult>,
    pub(crate) pending_store_taint: VecDeque<(Address, bool)>,

    // Slice state for the in-flight block.
    pub(crate) block_details: BlockDetails,
    pub(crate) block_start_reg_values: HashMap<RegOffset, RegisterValue>,
    pub(crate) block_concrete_dependencies: HashSet<RegOffset>,
    pub(crate) reg_instr_slice: HashMap<RegOffset, Vec<InstrDetails>>,
    pub(crate) instr_slice_details: HashMap<Address, InstrSliceDetails>,

    blocks_with_symbolic_instrs: Vec<BlockDetails>,
}

impl State {
    /// Bind a new driver to `engine`, sharing decoded code pages with
    /// every other state constructed under `cache_key`.
    pub fn new(engine: Box<dyn Engine>, cache_key: u64) -> Self {
        Self {
            engine: Some(engine),
            cache_key,
            page_cache: registry::acquire(cache_key),
            block_taint_cache: BlockTaintCache::new(),
            hooked: false,
            lifter: None,
            guest_arch: None,
            regs: RegisterInfo::new(),
            shadow: ShadowMemory::new(),
            write_log: WriteLog::new(),
            stop_points: BTreeSet::new(),
            stopped: false,
            stop_details: StopDetails::default(),
            cur_steps: 0,
            max_steps: 0,
            cur_block_addr: 0,
            cur_block_size: 0,
            track_bbls: false,
            track_stack: false,
            bbl_addrs: Vec::new(),
            stack_pointers: Vec::new(),
            executed_pages: BTreeSet::new(),
            executed_pages_drain: None,
            syscall_count: 0,
            interrupt_handled: false,
            transmit: None,
            transmit_records: Vec::new(),
            symbolic_registers: HashSet::new(),
            block_symbolic_registers: HashSet::new(),
            block_concrete_registers: HashSet::new(),
            block_symbolic_temps: HashSet::new(),
            cur_block_entry: None,
            taint_cursor: None,
            mem_read_parked_at: None,
            mem_reads_map: HashMap::new(),
            pending_store_taint: VecDeque::new(),
            block_details: BlockDetails::default(),
            block_start_reg_values: HashMap::new(),
            block_concrete_dependencies: HashSet::new(),
            reg_instr_slice: HashMap::new(),
            instr_slice_details: HashMap::new(),
            blocks_with_symbolic_instrs: Vec::new(),
        }
    }

    /// Enable callback processing for subsequent runs.
    pub fn hook(&mut self) {
        self.hooked = true;
    }

    /// Disable callback processing; the engine runs free.
    pub fn unhook(&mut self) {
        self.hooked = false;
    }

    pub fn is_hooked(&self) -> bool {
        self.hooked
    }

    /// The engine between runs, for host-side inspection and setup.
    pub fn engine_mut(&mut self) -> &mut dyn Engine {
        self.engine
            .as_mut()
            .expect("engine is present outside of a run")
            .as_mut()
    }

    /// Run the engine from `pc` for at most `max_steps` blocks.
    ///
    /// Returns the engine's own verdict; [State::stop_details] describes
    /// why and where the run ended regardless of that verdict.
    pub fn start(&mut self, pc: Address, max_steps: u64) -> crate::engine::Result<()> {
        self.cur_steps = 0;
        self.max_steps = max_steps;
        self.stopped = false;
        self.stop_details = StopDetails::default();
        self.cur_block_addr = 0;
        self.cur_block_size = 0;
        self.executed_pages_drain = None;
        self.bbl_addrs.clear();
        self.stack_pointers.clear();
        self.blocks_with_symbolic_instrs.clear();

        debug!("starting engine at {pc:#x} for {max_steps} block(s)");

        let mut engine = self
            .engine
            .take()
            .expect("engine is present outside of a run");
        let result = engine.run(pc, self);

        if !self.stopped {
            match &result {
                Ok(()) => {
                    self.finish_block();
                    self.stopped = true;
                    self.stop_details = StopDetails {
                        reason: StopReason::Normal,
                        block_addr: self.cur_block_addr,
                        block_size: self.cur_block_size as u64,
                    };
                }
                Err(error) => {
                    let reason = Self::stop_reason_for(*error);
                    self.stop_with(engine.as_mut(), reason);
                }
            }
        }

        self.engine = Some(engine);
        result
    }

    /// Request a halt with an explicit reason. Only callable between runs;
    /// during a run, stops are requested from inside callbacks.
    pub fn stop(&mut self, reason: StopReason) {
        let mut engine = self
            .engine
            .take()
            .expect("engine is present outside of a run");
        self.stop_with(engine.as_mut(), reason);
        self.engine = Some(engine);
    }

    fn stop_reason_for(error: crate::engine::Error) -> StopReason {
        use crate::engine::Error;
        match error {
            Error::ReadUnmapped(_) | Error::WriteUnmapped(_) | Error::Protection(_) => {
                StopReason::Segfault
            }
            Error::FetchUnmapped(_) => StopReason::Execnone,
            Error::InvalidInstruction => StopReason::Nodecode,
            Error::DivisionByZero => StopReason::ZeroDiv,
            Error::Halted => StopReason::Hlt,
            Error::InvalidArgument(_) | Error::Failure(_) => StopReason::Error,
        }
    }

    /// Halt the run: record the stop, roll the in-flight block back and
    /// tell the engine to return.
    pub(crate) fn stop_with(&mut self, ctx: &mut dyn EngineContext, reason: StopReason) {
        if self.stopped {
            return;
        }

        debug!(
            "stopping: {reason} at block {addr:#x}",
            addr = self.cur_block_addr
        );

        self.stopped = true;
        self.stop_details = StopDetails {
            reason,
            block_addr: self.cur_block_addr,
            block_size: self.cur_block_size as u64,
        };
        self.rollback_block(ctx);
        ctx.request_stop();
    }

    /// Commit the in-flight block: merge its register taint into the
    /// persistent set, finalize the write journal and record its
    /// re-execution details.
    fn finish_block(&mut self) {
        for reg in self.block_symbolic_registers.drain() {
            self.symbolic_registers.insert(reg);
        }
        for reg in self.block_concrete_registers.drain() {
            self.symbolic_registers.remove(&reg);
        }

        self.write_log.commit(&mut self.shadow);

        if self.block_details.has_symbolic_instrs() {
            trace!(
                "block {addr:#x} recorded {count} instruction(s) for re-execution",
                addr = self.block_details.block_addr,
                count = self.block_details.symbolic_instrs.len()
            );
            self.blocks_with_symbolic_instrs.push(self.block_details.clone());
        }

        self.reset_block_state();
    }

    /// Abandon the in-flight block: restore memory and shadow state and
    /// discard its taint and slice bookkeeping.
    fn rollback_block(&mut self, ctx: &mut dyn EngineContext) {
        if let Err(error) = self
            .write_log
            .rollback(&mut self.shadow, |addr, bytes| ctx.mem_write(addr, bytes))
        {
            warn!("rollback left engine memory inconsistent: {error}");
        }
        self.reset_block_state();
    }

    fn reset_block_state(&mut self) {
        self.block_symbolic_registers.clear();
        self.block_concrete_registers.clear();
        self.block_symbolic_temps.clear();
        self.cur_block_entry = None;
        self.taint_cursor = None;
        self.mem_read_parked_at = None;
        self.mem_reads_map.clear();
        self.pending_store_taint.clear();
        self.block_details.reset();
        self.block_start_reg_values.clear();
        self.block_concrete_dependencies.clear();
        self.reg_instr_slice.clear();
        self.instr_slice_details.clear();
    }

    /// Obtain the taint entry for the block at `addr`, lifting and
    /// analyzing on a cache miss. `None` means the stop has already been
    /// recorded.
    fn block_entry(
        &mut self,
        ctx: &mut dyn EngineContext,
        addr: Address,
        size: u32,
    ) -> Option<Arc<BlockTaintEntry>> {
        if let Some(entry) = self.block_taint_cache.get(addr) {
            return Some(entry);
        }

        let mut bytes = vec![0u8; size as usize];
        if ctx.mem_read(addr, &mut bytes).is_err() {
            self.block_details.lift_failed = true;
            self.stop_with(ctx, StopReason::VexLiftFailed);
            return None;
        }

        let lifter = self.lifter.as_mut().expect("tracking enabled");
        match lifter.lift(&bytes, addr) {
            Ok(block) => {
                let entry = analyze_block(&block, addr, &self.regs);
                Some(self.block_taint_cache.insert(addr, entry))
            }
            Err(vex_ir::Error::NoDecode(_)) => {
                self.block_details.lift_failed = true;
                self.stop_with(ctx, StopReason::Nodecode);
                None
            }
            Err(error) => {
                debug!("lift failed for block {addr:#x}: {error}");
                self.block_details.lift_failed = true;
                self.stop_with(ctx, StopReason::VexLiftFailed);
                None
            }
        }
    }

    /// Snapshot the concrete values of every register the block may need
    /// for slice replay.
    fn snapshot_dependencies(&mut self, ctx: &mut dyn EngineContext, entry: &BlockTaintEntry) {
        let mut offsets: BTreeSet<RegOffset> = BTreeSet::new();
        for instr in entry.instr_entries.values() {
            for dep in &instr.dependencies_to_save {
                if let crate::taint::TaintEntity::Reg(offset) = dep {
                    offsets.insert(*offset);
                }
            }
        }

        for offset in offsets {
            let Some(engine_reg) = self.regs.engine_reg(offset) else {
                continue;
            };
            let size = self.regs.reg_size(offset).unwrap_or(MAX_MEM_ACCESS_SIZE);
            let mut buf = [0u8; crate::MAX_REGISTER_BYTE_SIZE];
            if ctx.reg_read(engine_reg, &mut buf[..size]).is_ok() {
                self.block_start_reg_values
                    .insert(offset, RegisterValue { offset, value: buf });
            }
        }
    }

    fn handle_interrupt(&mut self, ctx: &mut dyn EngineContext, intno: u32) -> HookAction {
        trace!("interrupt {intno} at block {addr:#x}", addr = self.cur_block_addr);
        self.interrupt_handled = false;
        self.syscall_count += 1;

        let Some(descriptor) = self.transmit else {
            self.stop_with(ctx, StopReason::Syscall);
            return HookAction::Stop;
        };

        let read_u64 = |ctx: &mut dyn EngineContext, reg| -> Option<u64> {
            let mut buf = [0u8; 8];
            ctx.reg_read(reg, &mut buf).ok()?;
            Some(u64::from_le_bytes(buf))
        };

        let matches = read_u64(ctx, descriptor.num_reg) == Some(descriptor.sysno)
            && (descriptor.bbl_addr == 0 || descriptor.bbl_addr == self.cur_block_addr);
        if !matches {
            self.stop_with(ctx, StopReason::Syscall);
            return HookAction::Stop;
        }

        let buf_addr = read_u64(ctx, descriptor.buf_reg);
        let count = read_u64(ctx, descriptor.count_reg);
        if let (Some(buf_addr), Some(count)) = (buf_addr, count) {
            let mut data = vec![0u8; count as usize];
            if ctx.mem_read(buf_addr, &mut data).is_ok() {
                self.transmit_records.push(TransmitRecord {
                    data,
                    count: count as u32,
                });
                self.interrupt_handled = true;
                return HookAction::Continue;
            }
        }

        self.stop_with(ctx, StopReason::Syscall);
        HookAction::Stop
    }

    // -- host-facing configuration and inspection --------------------------

    /// Seed the set of symbolic registers; offsets are folded to full
    /// registers.
    pub fn symbolic_register_data(&mut self, offsets: impl IntoIterator<Item = RegOffset>) {
        self.symbolic_registers = offsets
            .into_iter()
            .map(|offset| self.regs.full_register_offset(offset))
            .collect();
    }

    /// The current symbolic register set, sorted.
    pub fn get_symbolic_registers(&self) -> Vec<RegOffset> {
        let mut regs: Vec<RegOffset> = self.symbolic_registers.iter().copied().collect();
        regs.sort_unstable();
        regs
    }

    /// Enable per-block taint tracking with the given lifter.
    pub fn enable_symbolic_tracking(
        &mut self,
        arch: GuestArch,
        archinfo: ArchInfo,
        lifter: Box<dyn Lifter>,
    ) {
        self.guest_arch = Some((arch, archinfo));
        self.lifter = Some(lifter);
    }

    /// Disable taint tracking; tainted reads then halt the run.
    pub fn disable_symbolic_tracking(&mut self) {
        self.guest_arch = None;
        self.lifter = None;
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.lifter.is_some()
    }

    pub fn guest_arch(&self) -> Option<&(GuestArch, ArchInfo)> {
        self.guest_arch.as_ref()
    }

    pub fn regs_mut(&mut self) -> &mut RegisterInfo {
        &mut self.regs
    }

    /// Replace the breakpoint set.
    pub fn set_stops(&mut self, stops: impl IntoIterator<Item = Address>) {
        self.stop_points = stops.into_iter().collect();
    }

    pub fn set_tracking(&mut self, track_bbls: bool, track_stack: bool) {
        self.track_bbls = track_bbls;
        self.track_stack = track_stack;
    }

    pub fn bbl_addrs(&self) -> &[Address] {
        &self.bbl_addrs
    }

    pub fn stack_pointers(&self) -> &[u64] {
        &self.stack_pointers
    }

    pub fn syscall_count(&self) -> u64 {
        self.syscall_count
    }

    /// Blocks executed in the current or last run.
    pub fn step_count(&self) -> u64 {
        self.cur_steps
    }

    pub fn is_interrupt_handled(&self) -> bool {
        self.interrupt_handled
    }

    pub fn set_transmit_descriptor(&mut self, descriptor: Option<TransmitDescriptor>) {
        self.transmit = descriptor;
    }

    /// Drain up to `num` captured transmit records.
    pub fn process_transmit(&mut self, num: usize) -> Vec<TransmitRecord> {
        let take = num.min(self.transmit_records.len());
        self.transmit_records.drain(..take).collect()
    }

    pub fn stop_details(&self) -> StopDetails {
        self.stop_details
    }

    pub fn blocks_with_symbolic_instrs(&self) -> &[BlockDetails] {
        &self.blocks_with_symbolic_instrs
    }

    /// Pages executed during the run, one per call, ascending. The
    /// iteration restarts at the next [State::start].
    pub fn next_executed_page(&mut self) -> Option<Address> {
        let pages = &self.executed_pages;
        self.executed_pages_drain
            .get_or_insert_with(|| pages.iter().rev().copied().collect())
            .pop()
    }

    // -- shadow memory and page cache --------------------------------------

    /// Activate shadow pages covering `[addr, addr + length)`, optionally
    /// seeding taint from `taint`.
    pub fn activate_page(&mut self, addr: Address, length: u64, taint: Option<&[u8]>) {
        let mut page_addr = page_base(addr);
        let end = addr + length;
        while page_addr < end {
            let offset = (page_addr - page_base(addr)) as usize;
            self.shadow.page_activate(page_addr, taint, offset);
            page_addr += PAGE_SIZE as u64;
        }
    }

    /// Dirty and symbolic memory runs for the host to read back.
    pub fn sync(&self) -> Vec<MemUpdate> {
        self.shadow.sync()
    }

    /// First tainted address in `[addr, addr + size)`, if any.
    pub fn find_tainted(&self, addr: Address, size: usize) -> Option<Address> {
        self.shadow.find_tainted(addr, size, &self.write_log)
    }

    /// Cache guest code pages under this state's cache key.
    pub fn cache_page(&mut self, addr: Address, bytes: &[u8], perms: PagePerms) -> bool {
        self.page_cache
            .lock()
            .expect("page cache poisoned")
            .cache_page(addr, bytes, perms)
    }

    /// Invalidate cached pages and analyzed blocks touching the region.
    pub fn uncache_pages_touching_region(&mut self, addr: Address, length: u64) {
        self.page_cache
            .lock()
            .expect("page cache poisoned")
            .uncache_pages_touching_region(addr, length);
        self.block_taint_cache.evict_region(addr, length);
    }

    pub fn clear_page_cache(&mut self) {
        self.page_cache
            .lock()
            .expect("page cache poisoned")
            .clear();
        self.block_taint_cache.clear();
    }

    pub fn in_cache(&self, addr: Address) -> bool {
        self.page_cache
            .lock()
            .expect("page cache poisoned")
            .in_cache(addr)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        registry::release(self.cache_key);
    }
}

impl EngineHooks for State {
    fn on_block(&mut self, ctx: &mut dyn EngineContext, addr: u64, size: u32) -> HookAction {
        if !self.hooked {
            return HookAction::Continue;
        }
        if self.stopped {
            ctx.request_stop();
            return HookAction::Stop;
        }

        trace!("block {addr:#x}+{size}");

        // The previous block's exit guard is judged against the taint it
        // accumulated before its state is folded away.
        let prev_guard_symbolic = match &self.cur_block_entry {
            Some(entry) => {
                let entry = Arc::clone(entry);
                self.final_taint_status(entry.exit_guard_deps.iter()).is_symbolic()
            }
            None => false,
        };

        self.finish_block();
        self.cur_block_addr = addr;
        self.cur_block_size = size;

        if prev_guard_symbolic {
            self.stop_with(ctx, StopReason::SymbolicCondition);
            return HookAction::Stop;
        }
        if self.stop_points.contains(&addr) {
            self.stop_with(ctx, StopReason::Stoppoint);
            return HookAction::Stop;
        }
        if self.cur_steps >= self.max_steps {
            self.stop_with(ctx, StopReason::Normal);
            return HookAction::Stop;
        }
        self.cur_steps += 1;

        if self.track_bbls {
            self.bbl_addrs.push(addr);
        }
        if self.track_stack {
            if let Some(sp_reg) = self.regs.sp_reg() {
                let mut buf = [0u8; 8];
                if ctx.reg_read(sp_reg, &mut buf).is_ok() {
                    self.stack_pointers.push(u64::from_le_bytes(buf));
                }
            }
        }
        self.executed_pages.insert(page_base(addr));

        self.block_details.block_addr = addr;
        self.block_details.block_size = size as u64;

        if self.lifter.is_none() {
            return HookAction::Continue;
        }

        let Some(entry) = self.block_entry(ctx, addr, size) else {
            return HookAction::Stop;
        };

        self.snapshot_dependencies(ctx, &entry);
        self.begin_propagation(entry);
        self.propagate_taints(ctx)
    }

    fn on_mem_read(&mut self, ctx: &mut dyn EngineContext, addr: u64, value: &[u8]) -> HookAction {
        if !self.hooked {
            return HookAction::Continue;
        }
        if self.stopped {
            ctx.request_stop();
            return HookAction::Stop;
        }

        if value.is_empty() || value.len() > MAX_MEM_ACCESS_SIZE {
            self.stop_with(ctx, StopReason::UnknownMemoryRead);
            return HookAction::Stop;
        }

        let is_value_tainted = self.find_tainted(addr, value.len()).is_some();

        if self.lifter.is_none() {
            if is_value_tainted {
                self.stop_with(ctx, StopReason::SymbolicReadSymbolicTrackingDisabled);
                return HookAction::Stop;
            }
            return HookAction::Continue;
        }

        let Some(instr_addr) = self.mem_read_parked_at else {
            // No instruction is waiting on a read. A read right after one
            // was consumed is an instruction performing several reads,
            // which re-execution cannot replay.
            let reason = if self.mem_reads_map.is_empty() {
                warn!("memory read at {addr:#x} outside any modeled instruction");
                StopReason::UnknownMemoryRead
            } else {
                StopReason::MultipleMemoryReads
            };
            self.stop_with(ctx, reason);
            return HookAction::Stop;
        };

        if self.mem_reads_map.contains_key(&instr_addr) {
            self.stop_with(ctx, StopReason::MultipleMemoryReads);
            return HookAction::Stop;
        }

        // A symbolic read address is a hard boundary: the concrete value
        // the engine just read must not be recorded as evidence.
        if self.parked_read_addr_symbolic(instr_addr) {
            self.stop_with(ctx, StopReason::SymbolicReadAddr);
            return HookAction::Stop;
        }

        let mut buf = [0u8; MAX_MEM_ACCESS_SIZE];
        buf[..value.len()].copy_from_slice(value);
        self.mem_reads_map.insert(
            instr_addr,
            MemReadResult {
                address: addr,
                value: buf,
                size: value.len() as u64,
                is_value_symbolic: is_value_tainted,
            },
        );

        self.resume_after_mem_read(ctx)
    }

    fn on_mem_write(&mut self, ctx: &mut dyn EngineContext, addr: u64, value: &[u8]) -> HookAction {
        if !self.hooked {
            return HookAction::Continue;
        }
        if self.stopped {
            ctx.request_stop();
            return HookAction::Stop;
        }

        if value.is_empty() || value.len() > MAX_MEM_ACCESS_SIZE {
            self.stop_with(ctx, StopReason::UnknownMemoryWrite);
            return HookAction::Stop;
        }

        // The hook fires before the write lands; the bytes currently in
        // memory are what rollback must restore.
        let mut old = [0u8; MAX_MEM_ACCESS_SIZE];
        if ctx.mem_read(addr, &mut old[..value.len()]).is_err() {
            // The engine will fault this access on its own.
            return HookAction::Continue;
        }

        let is_symbolic = self
            .pending_store_taint
            .pop_front()
            .map(|(_, symbolic)| symbolic)
            .unwrap_or(false);

        if let Err(error) =
            self.write_log
                .log_write(&mut self.shadow, addr, &old[..value.len()], is_symbolic)
        {
            warn!("write journal rejected {len}-byte write: {error}", len = value.len());
            self.stop_with(ctx, StopReason::UnknownMemoryWrite);
            return HookAction::Stop;
        }

        HookAction::Continue
    }

    fn on_unmapped(
        &mut self,
        ctx: &mut dyn EngineContext,
        kind: AccessKind,
        addr: u64,
        size: usize,
    ) -> bool {
        if !self.hooked || self.stopped {
            return false;
        }

        let mapped = {
            let cache = self.page_cache.lock().expect("page cache poisoned");
            cache.map_cache(addr, size.max(1) as u64, ctx)
        };
        if mapped {
            debug!("mapped cached page(s) for {kind:?} fault at {addr:#x}");
            return true;
        }

        let reason = if page_base(addr) == 0 {
            StopReason::Zeropage
        } else if kind == AccessKind::Fetch {
            StopReason::Execnone
        } else {
            StopReason::Segfault
        };
        self.stop_with(ctx, reason);
        false
    }

    fn on_protection_fault(
        &mut self,
        ctx: &mut dyn EngineContext,
        kind: AccessKind,
        addr: u64,
        _size: usize,
    ) -> bool {
        if !self.hooked || self.stopped {
            return false;
        }

        debug!("protection fault: {kind:?} at {addr:#x}");
        self.stop_with(ctx, StopReason::Segfault);
        false
    }

    fn on_interrupt(&mut self, ctx: &mut dyn EngineContext, intno: u32) -> HookAction {
        if !self.hooked {
            return HookAction::Continue;
        }
        if self.stopped {
            ctx.request_stop();
            return HookAction::Stop;
        }

        self.handle_interrupt(ctx, intno)
    }
}
