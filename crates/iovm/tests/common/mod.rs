//! Shared fake host: RAM-backed targets that record every callback.

#![allow(dead_code)] // Not every test binary uses every helper.

use std::collections::HashMap;

use iovm::{Host, IovmError, Progress, ReadOp, Target, WaitOp, WriteOp};

/// One recorded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Read { target: u8, address: u32, len: u32 },
    Write { target: u8, address: u32, data: Vec<u8> },
    Wait { initial: bool },
    Probe { target: u8, address: u32 },
    Ended(Result<(), IovmError>),
}

struct Bank {
    data: Vec<u8>,
    writable: bool,
}

/// RAM-backed host. Each defined target fronts a byte array; every
/// callback appends an [`Event`].
pub struct RamHost {
    banks: HashMap<u8, Bank>,
    /// Bytes moved per read/write invocation. Set smaller than the
    /// transfer length to exercise suspension.
    pub chunk: u32,
    /// Wait polls left before the fake timer expires.
    polls_left: Option<u32>,
    /// Everything the engine asked for, in order.
    pub events: Vec<Event>,
    /// Bytes delivered to the "client" by reads.
    pub read_data: Vec<u8>,
}

impl RamHost {
    pub fn new() -> Self {
        Self {
            banks: HashMap::new(),
            chunk: u32::MAX,
            polls_left: None,
            events: Vec::new(),
            read_data: Vec::new(),
        }
    }

    /// Add a writable RAM bank behind a target identifier.
    #[must_use]
    pub fn with_bank(mut self, target: u8, data: Vec<u8>) -> Self {
        self.banks.insert(target, Bank { data, writable: true });
        self
    }

    /// Add a read-only bank behind a target identifier.
    #[must_use]
    pub fn with_rom(mut self, target: u8, data: Vec<u8>) -> Self {
        self.banks.insert(
            target,
            Bank {
                data,
                writable: false,
            },
        );
        self
    }

    /// A bank's current contents.
    pub fn bank(&self, target: u8) -> &[u8] {
        &self.banks[&target].data
    }

    /// Mutable view of a bank, for tests that flip wait bytes mid-run.
    pub fn bank_mut(&mut self, target: u8) -> &mut Vec<u8> {
        &mut self.banks.get_mut(&target).expect("bank defined").data
    }

    /// How many end notifications have been delivered.
    pub fn ends(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, Event::Ended(_)))
            .count()
    }

    fn range_check(bank: &Bank, address: u32, len: u32) -> Result<usize, IovmError> {
        let start = address as usize;
        if start + len as usize > bank.data.len() {
            return Err(IovmError::TargetAddressOutOfRange);
        }
        Ok(start)
    }
}

impl Default for RamHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for RamHost {
    fn read(&mut self, op: &mut ReadOp) -> Result<Progress, IovmError> {
        if op.initial {
            self.events.push(Event::Read {
                target: op.target.get(),
                address: op.address,
                len: op.len,
            });
        }
        let chunk = self.chunk.min(op.remaining);
        let bank = self
            .banks
            .get(&op.target.get())
            .ok_or(IovmError::TargetUndefined)?;
        let start = Self::range_check(bank, op.address, chunk)?;
        self.read_data
            .extend_from_slice(&bank.data[start..start + chunk as usize]);
        op.address += chunk;
        op.remaining -= chunk;
        if op.remaining == 0 {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Pending)
        }
    }

    fn write(&mut self, op: &mut WriteOp, data: &[u8]) -> Result<Progress, IovmError> {
        if op.initial {
            self.events.push(Event::Write {
                target: op.target.get(),
                address: op.address,
                data: data.to_vec(),
            });
        }
        let chunk = self.chunk.min(op.remaining);
        let bank = self
            .banks
            .get_mut(&op.target.get())
            .ok_or(IovmError::TargetUndefined)?;
        if !bank.writable {
            return Err(IovmError::TargetNotWritable);
        }
        let start = Self::range_check(bank, op.address, chunk)?;
        let done = (op.len - op.remaining) as usize;
        bank.data[start..start + chunk as usize]
            .copy_from_slice(&data[done..done + chunk as usize]);
        op.address += chunk;
        op.remaining -= chunk;
        if op.remaining == 0 {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Pending)
        }
    }

    fn wait(&mut self, op: &mut WaitOp) -> Result<Progress, IovmError> {
        self.events.push(Event::Wait {
            initial: op.initial,
        });
        if op.initial {
            self.polls_left = if op.timeout == 0 {
                None
            } else {
                Some(op.timeout)
            };
        }
        let bank = self
            .banks
            .get(&op.target.get())
            .ok_or(IovmError::TargetUndefined)?;
        let start = Self::range_check(bank, op.address, 1)?;
        if op.test_byte(bank.data[start]) {
            return Ok(Progress::Complete);
        }
        if let Some(polls) = &mut self.polls_left {
            *polls -= 1;
            if *polls == 0 {
                return Err(IovmError::TimedOut);
            }
        }
        Ok(Progress::Pending)
    }

    fn probe(&mut self, target: Target, address: u32) -> Result<u8, IovmError> {
        self.events.push(Event::Probe {
            target: target.get(),
            address,
        });
        let bank = self
            .banks
            .get(&target.get())
            .ok_or(IovmError::TargetUndefined)?;
        let start = Self::range_check(bank, address, 1)?;
        Ok(bank.data[start])
    }

    fn ended(&mut self, result: Result<(), IovmError>) {
        self.events.push(Event::Ended(result));
    }
}
