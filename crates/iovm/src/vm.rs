//! The virtual machine: lifecycle, decode loop, and operation dispatch.

use log::{debug, trace};

use crate::cmp::Comparison;
use crate::error::IovmError;
use crate::host::{Host, Progress, ReadOp, WaitOp, WriteOp};
use crate::opcode::{Instruction, Opcode};
use crate::program::Cursor;
use crate::registers::{ADDRESS_MASK, Registers, TargetDescriptor};

/// Execution state observable through [`Iovm::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Fresh machine; no program loaded.
    Init,
    /// A program is loaded and ready to run.
    Loaded,
    /// Per-run state will be cleared by the next step.
    Reset,
    /// Between instructions.
    ExecuteNext,
    /// Suspended inside a read.
    Read,
    /// Suspended inside a write.
    Write,
    /// Suspended inside a wait.
    Wait,
    /// The program terminated.
    Ended,
    /// An error latched; inspect [`Iovm::error`].
    Errored,
}

impl State {
    /// Whether a run is in flight: between instructions or suspended
    /// inside an operation.
    const fn in_flight(self) -> bool {
        matches!(self, Self::ExecuteNext | Self::Read | Self::Write | Self::Wait)
    }
}

/// The active operation record, discriminated alongside [`State`].
enum Operation {
    Idle,
    Read { channel: usize, op: ReadOp },
    Write { channel: usize, op: WriteOp },
    Wait(WaitOp),
}

/// What one dispatched instruction did to the control flow.
enum Flow {
    /// Instant instruction; decode the next one.
    Continue,
    /// An operation was entered; return to the host with the operation
    /// either suspended or already retired to EXECUTE_NEXT.
    Yield,
    /// The procedure terminated.
    Done,
}

/// A resumable interpreter for byte-encoded I/O procedures.
///
/// The machine borrows the program for the duration of a load/execute
/// cycle and owns its host. [`step`](Self::step) runs until the procedure
/// ends, an operation suspends awaiting more host work, or an error
/// latches; the host drives it from its own scheduling context.
pub struct Iovm<'p, H: Host> {
    host: H,
    cursor: Cursor<'p>,
    state: State,
    error: Option<IovmError>,
    /// Offset of the current instruction byte, kept for fault reporting.
    inst_offset: usize,
    registers: Registers,
    op: Operation,
}

impl<'p, H: Host> Iovm<'p, H> {
    /// Create a machine in the INIT state with zeroed registers.
    pub fn new(host: H) -> Self {
        Self {
            host,
            cursor: Cursor::new(&[]),
            state: State::Init,
            error: None,
            inst_offset: 0,
            registers: Registers::default(),
            op: Operation::Idle,
        }
    }

    /// Load a procedure. Only legal in the INIT state.
    pub fn load(&mut self, program: &'p [u8]) -> Result<(), IovmError> {
        if self.state != State::Init {
            return Err(IovmError::InvalidOperationForState);
        }
        self.cursor = Cursor::new(program);
        self.state = State::Loaded;
        trace!("loaded {} byte procedure", program.len());
        Ok(())
    }

    /// Rearm a finished (or not yet started) run.
    ///
    /// Legal from LOADED, RESET, ENDED, and ERRORED. Rejected while a run
    /// is in flight, and in INIT, where no program exists to rearm.
    pub fn reset(&mut self) -> Result<(), IovmError> {
        if self.state == State::Init || self.state.in_flight() {
            return Err(IovmError::InvalidOperationForState);
        }
        self.state = State::Reset;
        Ok(())
    }

    /// The current execution state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// The latched error, if the machine is in the ERRORED state.
    #[must_use]
    pub const fn error(&self) -> Option<IovmError> {
        self.error
    }

    /// The register file.
    #[must_use]
    pub const fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Offset of the most recently fetched instruction byte.
    #[must_use]
    pub const fn instruction_offset(&self) -> usize {
        self.inst_offset
    }

    /// Access the host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutably access the host.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Run one cooperative step.
    ///
    /// Returns when the procedure ends, when an operation suspends
    /// awaiting more host work, or when an error latches. Idempotent in
    /// the terminal states: no callbacks run and the latched result is
    /// returned unchanged.
    pub fn step(&mut self) -> Result<State, IovmError> {
        match self.state {
            // An error is always latched before the state becomes ERRORED.
            State::Errored => {
                return Err(self.error.unwrap_or(IovmError::InvalidOperationForState));
            }
            State::Ended => return Ok(State::Ended),
            State::Init => return Err(IovmError::InvalidOperationForState),
            State::Loaded | State::Reset => self.begin_run(),
            State::ExecuteNext | State::Read | State::Write | State::Wait => {}
        }

        // Re-enter a suspended operation. Completion retires it and ends
        // the step in EXECUTE_NEXT; decoding resumes on the next step.
        if matches!(self.state, State::Read | State::Write | State::Wait) {
            return match self.advance_operation() {
                Ok(Progress::Pending) => Ok(self.state),
                Ok(Progress::Complete) => {
                    self.finish_operation();
                    Ok(self.state)
                }
                Err(error) => Err(self.latch(error)),
            };
        }

        self.execute_next()
    }

    /// Clear per-run state and arm the decode loop. Register contents
    /// survive; only the program sets them.
    fn begin_run(&mut self) {
        self.cursor.rewind();
        self.inst_offset = 0;
        self.error = None;
        self.op = Operation::Idle;
        self.state = State::ExecuteNext;
    }

    /// Decode and dispatch instructions until one enters an operation,
    /// the procedure ends, or an error latches. Configuration opcodes
    /// chain inline within the step.
    fn execute_next(&mut self) -> Result<State, IovmError> {
        loop {
            match self.dispatch_one() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => return Ok(self.state),
                Ok(Flow::Done) => return Ok(State::Ended),
                Err(error) => return Err(self.latch(error)),
            }
        }
    }

    fn dispatch_one(&mut self) -> Result<Flow, IovmError> {
        self.inst_offset = self.cursor.offset();
        let Some(byte) = self.cursor.fetch_u8() else {
            self.finish_run();
            return Ok(Flow::Done);
        };
        let inst = Instruction::decode(byte)?;
        trace!("{:#06X}: {:?}", self.inst_offset, inst.opcode);

        let channel = inst.channel;
        match inst.opcode {
            Opcode::End => {
                self.finish_run();
                Ok(Flow::Done)
            }
            Opcode::SetAddr8 => {
                let value = self.operand_u8()?;
                self.registers.channel_mut(channel).address = u32::from(value);
                Ok(Flow::Continue)
            }
            Opcode::SetAddr16 => {
                let value = self.operand_u16()?;
                self.registers.channel_mut(channel).address = u32::from(value);
                Ok(Flow::Continue)
            }
            Opcode::SetAddr24 => {
                let value = self.operand_u24()?;
                self.registers.channel_mut(channel).address = value;
                Ok(Flow::Continue)
            }
            Opcode::SetTarget => {
                let value = self.operand_u8()?;
                self.registers.channel_mut(channel).descriptor = TargetDescriptor::new(value);
                Ok(Flow::Continue)
            }
            Opcode::SetLen => {
                let value = self.operand_u16()?;
                self.registers.channel_mut(channel).len_raw = value;
                Ok(Flow::Continue)
            }
            Opcode::SetCmpMask => {
                let value = self.operand_u8()?;
                let mask = self.operand_u8()?;
                let regs = self.registers.channel_mut(channel);
                regs.cmp = value;
                regs.mask = mask;
                Ok(Flow::Continue)
            }
            Opcode::SetTimeout => {
                let value = self.operand_u32()?;
                self.registers.channel_mut(channel).timeout = value;
                Ok(Flow::Continue)
            }
            Opcode::Read => self.begin_read(channel),
            Opcode::Write => self.begin_write(channel),
            Opcode::WaitWhile(comparison) => self.begin_wait(channel, comparison),
            Opcode::AbortIf(comparison) => {
                self.abort_probe(channel, comparison)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn begin_read(&mut self, channel: usize) -> Result<Flow, IovmError> {
        let regs = *self.registers.channel(channel);
        let len = regs.transfer_len();
        self.op = Operation::Read {
            channel,
            op: ReadOp {
                target: regs.descriptor.target(),
                address: regs.address,
                len_raw: regs.len_raw,
                len,
                remaining: len,
                initial: true,
            },
        };
        self.state = State::Read;
        self.enter_operation()
    }

    fn begin_write(&mut self, channel: usize) -> Result<Flow, IovmError> {
        let regs = *self.registers.channel(channel);
        let len = regs.transfer_len();
        let data_offset = self.cursor.offset();
        // Reserve the payload now so decoding resumes past it.
        self.cursor
            .take_slice(len as usize)
            .ok_or(IovmError::OutOfRange)?;
        self.op = Operation::Write {
            channel,
            op: WriteOp {
                target: regs.descriptor.target(),
                address: regs.address,
                len_raw: regs.len_raw,
                len,
                remaining: len,
                data_offset,
                initial: true,
            },
        };
        self.state = State::Write;
        self.enter_operation()
    }

    fn begin_wait(&mut self, channel: usize, comparison: Comparison) -> Result<Flow, IovmError> {
        let regs = *self.registers.channel(channel);
        self.op = Operation::Wait(WaitOp {
            target: regs.descriptor.target(),
            address: regs.address,
            value: regs.cmp,
            mask: regs.mask,
            comparison,
            timeout: regs.timeout,
            initial: true,
        });
        self.state = State::Wait;
        self.enter_operation()
    }

    /// First invocation of a freshly entered operation.
    fn enter_operation(&mut self) -> Result<Flow, IovmError> {
        match self.advance_operation()? {
            Progress::Pending => Ok(Flow::Yield),
            Progress::Complete => {
                self.finish_operation();
                Ok(Flow::Yield)
            }
        }
    }

    /// Hand the active operation record to the matching host callback.
    fn advance_operation(&mut self) -> Result<Progress, IovmError> {
        match &mut self.op {
            Operation::Read { op, .. } => {
                let progress = self.host.read(op)?;
                op.initial = false;
                Ok(progress)
            }
            Operation::Write { op, .. } => {
                let data = self
                    .cursor
                    .slice_at(op.data_offset, op.len as usize)
                    .ok_or(IovmError::OutOfRange)?;
                let progress = self.host.write(op, data)?;
                op.initial = false;
                Ok(progress)
            }
            Operation::Wait(op) => {
                let progress = self.host.wait(op)?;
                op.initial = false;
                Ok(progress)
            }
            Operation::Idle => Err(IovmError::InvalidOperationForState),
        }
    }

    /// Retire the completed operation and resume the decode loop.
    fn finish_operation(&mut self) {
        match std::mem::replace(&mut self.op, Operation::Idle) {
            Operation::Read { channel, op } => self.advance_channel(channel, op.len),
            Operation::Write { channel, op } => self.advance_channel(channel, op.len),
            Operation::Wait(_) | Operation::Idle => {}
        }
        self.state = State::ExecuteNext;
    }

    /// Apply the descriptor's auto-advance flag after a completed
    /// transfer.
    fn advance_channel(&mut self, channel: usize, len: u32) {
        let regs = self.registers.channel_mut(channel);
        if regs.descriptor.auto_advance() {
            regs.address = regs.address.wrapping_add(len) & ADDRESS_MASK;
        }
    }

    /// Probe one byte and abort the run if the comparison holds.
    fn abort_probe(&mut self, channel: usize, comparison: Comparison) -> Result<(), IovmError> {
        let regs = *self.registers.channel(channel);
        let byte = self.host.probe(regs.descriptor.target(), regs.address)?;
        if comparison.test(byte & regs.mask, regs.cmp) {
            return Err(IovmError::Aborted);
        }
        Ok(())
    }

    fn finish_run(&mut self) {
        self.state = State::Ended;
        trace!("procedure ended at {:#06X}", self.cursor.offset());
        self.host.ended(Ok(()));
    }

    /// Latch an error, move to ERRORED, and notify the host once.
    fn latch(&mut self, error: IovmError) -> IovmError {
        debug!("{error} at {:#06X}", self.inst_offset);
        self.error = Some(error);
        self.state = State::Errored;
        self.op = Operation::Idle;
        self.host.ended(Err(error));
        error
    }

    fn operand_u8(&mut self) -> Result<u8, IovmError> {
        self.cursor.fetch_u8().ok_or(IovmError::OutOfRange)
    }

    fn operand_u16(&mut self) -> Result<u16, IovmError> {
        self.cursor.fetch_u16().ok_or(IovmError::OutOfRange)
    }

    fn operand_u24(&mut self) -> Result<u32, IovmError> {
        self.cursor.fetch_u24().ok_or(IovmError::OutOfRange)
    }

    fn operand_u32(&mut self) -> Result<u32, IovmError> {
        self.cursor.fetch_u32().ok_or(IovmError::OutOfRange)
    }
}
