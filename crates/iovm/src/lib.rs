//! Resumable I/O virtual machine for memory-mapped device targets.
//!
//! A client authors a compact byte-encoded procedure of reads, writes,
//! and waits against numbered memory targets (work RAM, video RAM,
//! cartridge ROM, ...). The host buffers the whole procedure, loads it,
//! and drives the machine one cooperative step at a time; every actual
//! memory touch is delegated to the host through the [`Host`] trait, and
//! an operation the host cannot finish instantly suspends the machine
//! between steps instead of blocking.
//!
//! The engine allocates nothing on the execution path and runs in strict
//! program order: it fetches one instruction byte, executes configuration
//! opcodes inline against the four-channel register file, and hands read,
//! write, and wait operations to the host's state machines until they
//! report completion. Errors latch the machine in a terminal state until
//! the host rearms it with [`Iovm::reset`].

mod cmp;
mod error;
mod host;
mod opcode;
mod program;
mod registers;
mod vm;

pub use cmp::Comparison;
pub use error::IovmError;
pub use host::{Host, Progress, ReadOp, WaitOp, WriteOp};
pub use opcode::{Instruction, Opcode};
pub use program::ProgramBuilder;
pub use registers::{
    ADDRESS_MASK, AUTO_ADVANCE, CHANNELS, ChannelRegisters, MAX_LEN, Registers, TARGET_MASK,
    Target, TargetDescriptor,
};
pub use vm::{Iovm, State};
