//! The call contract of the debug transport.
//!
//! The flashing engine never talks to a probe directly. Everything it needs
//! from the target core is expressed by the [`Transport`] trait: halting and
//! resuming the core, memory and core register access, and waiting for a
//! downloaded routine to hit its return trap.

pub mod registers;

#[cfg(any(test, feature = "test"))]
pub mod fake;

use std::time::Instant;

use nvmflash_target::{Architecture, InstructionSet};

pub use registers::{CallingConvention, RegisterId};

/// What the core was doing when [`Transport::run_to_breakpoint_or_timeout`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The core stopped on a breakpoint, i.e. the routine returned into the trap.
    Halted,
    /// The deadline passed while the core was still running.
    Running,
    /// The core locked up and will not make progress on its own.
    LockedUp,
}

/// An error reported by a [`Transport`] implementation.
///
/// The engine does not look into these errors, it only forwards them.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TransportError {
    /// The transport timed out while talking to the core.
    Timeout,

    /// {0}
    Other(#[from] anyhow::Error),
}

/// Exclusive access to a single core of the target.
///
/// All calls are blocking. A flasher holds a mutable borrow of its transport
/// for its whole lifetime, so no two flash sessions can interleave on the same core.
pub trait Transport {
    /// The architecture of the core behind this transport.
    fn architecture(&self) -> Architecture;

    /// The instruction set the core executes downloaded routines in.
    fn instruction_set(&self) -> InstructionSet {
        match self.architecture() {
            Architecture::Arm => InstructionSet::Thumb2,
            Architecture::Riscv => InstructionSet::RV32,
        }
    }

    /// Halts the core.
    fn halt_core(&mut self) -> Result<(), TransportError>;

    /// Resumes execution at the current program counter.
    fn resume_core(&mut self) -> Result<(), TransportError>;

    /// Writes `data` to target memory starting at `address`.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Fills `data` with target memory starting at `address`.
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), TransportError>;

    /// Writes a core register of a halted core.
    fn write_core_register(&mut self, register: RegisterId, value: u32)
        -> Result<(), TransportError>;

    /// Reads a core register of a halted core.
    fn read_core_register(&mut self, register: RegisterId) -> Result<u32, TransportError>;

    /// Blocks until the core halts or `deadline` passes, whichever comes first.
    fn run_to_breakpoint_or_timeout(
        &mut self,
        deadline: Instant,
    ) -> Result<RunOutcome, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn architecture(&self) -> Architecture {
        (**self).architecture()
    }

    fn instruction_set(&self) -> InstructionSet {
        (**self).instruction_set()
    }

    fn halt_core(&mut self) -> Result<(), TransportError> {
        (**self).halt_core()
    }

    fn resume_core(&mut self) -> Result<(), TransportError> {
        (**self).resume_core()
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_memory(address, data)
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_memory(address, data)
    }

    fn write_core_register(
        &mut self,
        register: RegisterId,
        value: u32,
    ) -> Result<(), TransportError> {
        (**self).write_core_register(register, value)
    }

    fn read_core_register(&mut self, register: RegisterId) -> Result<u32, TransportError> {
        (**self).read_core_register(register)
    }

    fn run_to_breakpoint_or_timeout(
        &mut self,
        deadline: Instant,
    ) -> Result<RunOutcome, TransportError> {
        (**self).run_to_breakpoint_or_timeout(deadline)
    }
}
