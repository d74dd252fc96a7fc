//! Data model for the lifted intermediate representation consumed by the
//! `concolic-taint` core, together with the [lifter::Lifter] interface that
//! produces it.
//!
//! The IR is a three-address form over explicit temporaries: a block is a
//! straight-line sequence of statements (register puts, temporary writes,
//! stores, conditional side exits) delimited by instruction marks, ending in
//! a next-address expression. Lifters translate a linear range of guest
//! bytes into this form; the core only ever borrows a lifted block for the
//! duration of one analysis call.

/// Statement, expression and block types of the lifted IR.
pub mod ir;

/// The lifter interface and guest architecture descriptors.
pub mod lifter;

pub use ir::{BinOp, IrBlock, IrExpr, IrStmt, JumpKind, UnOp};
pub use lifter::{ArchInfo, Endianness, Error, GuestArch, Lifter, Result};

/// A guest memory address.
pub type Address = u64;

/// A register identified by its lifter byte offset into the guest state.
pub type RegOffset = u64;

/// An intra-block temporary identifier.
pub type TempId = u64;
