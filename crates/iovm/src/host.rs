//! Host callback surface.
//!
//! The engine touches no memory itself. Every read, write, wait poll, and
//! abort probe is delegated to the host through [`Host`], and any callback
//! that cannot finish instantly returns [`Progress::Pending`], suspending
//! the machine until the next step.

use crate::cmp::Comparison;
use crate::error::IovmError;
use crate::registers::Target;

/// Outcome of one host callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation needs further steps; the machine stays suspended.
    Pending,
    /// The operation finished; execution resumes at the next instruction.
    Complete,
}

/// Working state of an in-flight read.
///
/// The host owns the transfer: it moves bytes from the target to its
/// client (however it delivers them), updating `address` and `remaining`
/// as it goes. The engine consults the channel registers, not this
/// record, once the host reports [`Progress::Complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOp {
    /// Memory target to read from.
    pub target: Target,
    /// Next address to read.
    pub address: u32,
    /// Raw length operand; zero encodes the maximum.
    pub len_raw: u16,
    /// Total transfer length in bytes.
    pub len: u32,
    /// Bytes not yet transferred.
    pub remaining: u32,
    /// True on the first invocation for this operation.
    pub initial: bool,
}

/// Working state of an in-flight write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOp {
    /// Memory target to write to.
    pub target: Target,
    /// Next address to write.
    pub address: u32,
    /// Raw length operand; zero encodes the maximum.
    pub len_raw: u16,
    /// Total transfer length in bytes.
    pub len: u32,
    /// Bytes not yet transferred.
    pub remaining: u32,
    /// Offset of the payload within the program buffer.
    pub data_offset: usize,
    /// True on the first invocation for this operation.
    pub initial: bool,
}

/// Working state of an in-flight wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOp {
    /// Memory target to poll.
    pub target: Target,
    /// Address of the polled byte.
    pub address: u32,
    /// Comparison value.
    pub value: u8,
    /// Mask applied to the polled byte before it is compared.
    pub mask: u8,
    /// Comparison the wait holds on.
    pub comparison: Comparison,
    /// Timeout in host-defined ticks; zero means unbounded.
    pub timeout: u32,
    /// True on the first invocation; hosts restart their timer on it.
    pub initial: bool,
}

impl WaitOp {
    /// Whether an observed byte releases the wait.
    ///
    /// The wait holds while the masked comparison is true and completes
    /// as soon as it stops holding.
    #[must_use]
    pub fn test_byte(&self, byte: u8) -> bool {
        !self.comparison.test(byte & self.mask, self.value)
    }
}

/// The host side of the machine.
///
/// One value supplies the five capabilities the engine needs: advancing
/// the three operation state machines, the synchronous abort probe, and
/// the end-of-run notification. The machine owns its host
/// ([`Iovm::host_mut`](crate::Iovm::host_mut)), so callbacks keep their
/// own state without any global.
pub trait Host {
    /// Advance the current read operation.
    fn read(&mut self, op: &mut ReadOp) -> Result<Progress, IovmError>;

    /// Advance the current write operation.
    ///
    /// `data` is the full payload from the program buffer; `op.remaining`
    /// tracks how much of it is left to move.
    fn write(&mut self, op: &mut WriteOp, data: &[u8]) -> Result<Progress, IovmError>;

    /// Advance the current wait operation.
    ///
    /// The host owns timing: bound the wait using `op.timeout`,
    /// restarting the clock when `op.initial` is set, and return
    /// [`IovmError::TimedOut`] when it expires.
    fn wait(&mut self, op: &mut WaitOp) -> Result<Progress, IovmError>;

    /// Synchronously read one byte for an abort probe.
    fn probe(&mut self, target: Target, address: u32) -> Result<u8, IovmError>;

    /// The run reached a terminal state, successfully or with the given
    /// error. Invoked exactly once per run.
    fn ended(&mut self, result: Result<(), IovmError>);
}
