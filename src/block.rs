use vex_ir::{Address, RegOffset};

use crate::{MAX_MEM_ACCESS_SIZE, MAX_REGISTER_BYTE_SIZE};

/// A concrete memory value observed during execution, at most
/// [MAX_MEM_ACCESS_SIZE] bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MemoryValue {
    pub address: u64,
    pub value: [u8; MAX_MEM_ACCESS_SIZE],
    pub size: u64,
}

impl MemoryValue {
    pub fn bytes(&self) -> &[u8] {
        &self.value[..self.size as usize]
    }
}

/// A concrete register value snapshotted at block entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub offset: RegOffset,
    pub value: [u8; MAX_REGISTER_BYTE_SIZE],
}

impl RegisterValue {
    pub fn new(offset: RegOffset, bytes: &[u8]) -> Self {
        let mut value = [0u8; MAX_REGISTER_BYTE_SIZE];
        value[..bytes.len().min(MAX_REGISTER_BYTE_SIZE)]
            .copy_from_slice(&bytes[..bytes.len().min(MAX_REGISTER_BYTE_SIZE)]);
        Self { offset, value }
    }
}

/// What the symbolic executor needs to replay one instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InstrDetails {
    pub instr_addr: Address,
    pub has_memory_dep: bool,
    pub memory_value: MemoryValue,
}

impl InstrDetails {
    pub fn without_memory(instr_addr: Address) -> Self {
        Self {
            instr_addr,
            has_memory_dep: false,
            memory_value: MemoryValue::default(),
        }
    }
}

/// Result of one memory read executed by the engine, keyed by the reading
/// instruction's address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemReadResult {
    pub address: u64,
    pub value: [u8; MAX_MEM_ACCESS_SIZE],
    pub size: u64,
    pub is_value_symbolic: bool,
}

impl MemReadResult {
    pub fn memory_value(&self) -> MemoryValue {
        MemoryValue {
            address: self.address,
            value: self.value,
            size: self.size,
        }
    }
}

/// Everything the symbolic executor needs about one executed block:
/// the instructions to re-execute and the concrete register values their
/// slices depend on. Reset at every block start.
#[derive(Debug, Clone, Default)]
pub struct BlockDetails {
    pub block_addr: Address,
    pub block_size: u64,

    /// Instructions to re-execute symbolically, ascending by address.
    pub symbolic_instrs: Vec<InstrDetails>,

    /// Concrete register snapshot the slices depend on.
    pub register_values: Vec<RegisterValue>,

    /// The lifter failed on this block; taint tracking was suspended.
    pub lift_failed: bool,
}

impl BlockDetails {
    pub fn reset(&mut self) {
        self.block_addr = 0;
        self.block_size = 0;
        self.lift_failed = false;
        self.symbolic_instrs.clear();
        self.register_values.clear();
    }

    pub fn has_symbolic_instrs(&self) -> bool {
        !self.symbolic_instrs.is_empty()
    }
}

/// One captured transmit: the bytes the guest asked to write out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitRecord {
    pub data: Vec<u8>,
    pub count: u32,
}
