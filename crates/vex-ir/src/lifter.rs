use std::borrow::Cow;

use crate::{ir::IrBlock, Address};

/// Result returned by lifter APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a lifter can report for a block of guest bytes.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The bytes at the block start do not decode to any instruction.
    #[error("no instruction decodes at {0:#x}")]
    NoDecode(Address),

    /// The bytes decode but the lifter cannot translate them.
    #[error("failed to lift block at {addr:#x}: {message}")]
    LiftFailed {
        addr: Address,
        message: Cow<'static, str>,
    },
}

/// Guest architectures a lifter may target. The core treats the value as
/// opaque apart from routing it back to the lifter configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GuestArch {
    X86,
    Amd64,
    Arm,
    Arm64,
    Mips32,
    Mips64,
}

/// Guest byte order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Architecture details a host passes alongside [GuestArch] when enabling
/// symbolic register tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchInfo {
    /// Width of a guest pointer in bits.
    pub bits: u32,

    /// Guest byte order.
    pub endianness: Endianness,
}

impl ArchInfo {
    pub fn new(bits: u32, endianness: Endianness) -> Self {
        Self { bits, endianness }
    }
}

/// Interface of the external IR lifter.
///
/// A lifter turns the guest bytes of one basic block into an [IrBlock]. The
/// caller supplies the bytes (it owns the guest memory image) and the block
/// start address; the lifter decides where the block ends, which is at or
/// before the end of the supplied range.
pub trait Lifter {
    /// Lift the block starting at `addr` from `bytes`.
    fn lift(&mut self, bytes: &[u8], addr: Address) -> Result<IrBlock>;
}
