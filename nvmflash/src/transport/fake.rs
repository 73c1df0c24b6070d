//! A simulated core with flash, for testing the flashing engine without hardware.
//!
//! The fake understands flash algorithms registered with
//! [`FakeTransport::with_algorithm`]. Once the image of such an algorithm is
//! written to RAM, resuming the core at one of its entry points performs the
//! routine on the simulated flash, and halts on return.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use nvmflash_target::{Architecture, RawFlashAlgorithm};

use super::{CallingConvention, RegisterId, RunOutcome, Transport, TransportError};
use crate::flashing::{FlashAlgorithm, Routine};

/// A call made on the [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `halt_core`
    HaltCore,
    /// `resume_core`
    ResumeCore,
    /// `write_memory`
    WriteMemory {
        /// Start address.
        address: u64,
        /// Number of bytes.
        len: usize,
    },
    /// `read_memory`
    ReadMemory {
        /// Start address.
        address: u64,
        /// Number of bytes.
        len: usize,
    },
    /// `write_core_register`
    WriteRegister(RegisterId, u32),
    /// `read_core_register`
    ReadRegister(RegisterId),
    /// `run_to_breakpoint_or_timeout`
    RunToBreakpoint,
}

/// A routine of a flash algorithm which was started on the [`FakeTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineCall {
    /// The routine.
    pub routine: Routine,
    /// The values of the four argument registers.
    pub arguments: [u32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreStatus {
    Running,
    Halted,
    Hung,
    LockedUp,
}

#[derive(Debug, Clone, Copy)]
struct Resident {
    algorithm: usize,
    code_start: u64,
}

/// A simulated target core, see the [module documentation](self).
#[derive(Debug)]
pub struct FakeTransport {
    architecture: Architecture,
    memory: BTreeMap<u64, u8>,
    registers: HashMap<RegisterId, u32>,
    algorithms: Vec<RawFlashAlgorithm>,
    resident: Option<Resident>,
    status: CoreStatus,
    failures: HashMap<Routine, u32>,
    single_failures: HashMap<Routine, u32>,
    hangs: HashSet<Routine>,
    lock_ups: HashSet<Routine>,
    corrupt_reads: bool,
    memory_writes: usize,
    failing_write: Option<usize>,
    calls: Vec<TransportCall>,
    routine_calls: Vec<RoutineCall>,
}

impl FakeTransport {
    /// Creates a running core without any known flash algorithm.
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            memory: BTreeMap::new(),
            registers: HashMap::new(),
            algorithms: vec![],
            resident: None,
            status: CoreStatus::Running,
            failures: HashMap::new(),
            single_failures: HashMap::new(),
            hangs: HashSet::new(),
            lock_ups: HashSet::new(),
            corrupt_reads: false,
            memory_writes: 0,
            failing_write: None,
            calls: vec![],
            routine_calls: vec![],
        }
    }

    /// Makes the fake execute `algorithm` when its image is loaded.
    pub fn with_algorithm(mut self, algorithm: &RawFlashAlgorithm) -> Self {
        self.algorithms.push(algorithm.clone());
        self
    }

    /// Makes `routine` return `code` instead of doing its work.
    pub fn fail_routine(&mut self, routine: Routine, code: u32) {
        self.failures.insert(routine, code);
    }

    /// Makes the next call of `routine` return `code` instead of doing its work.
    pub fn fail_routine_once(&mut self, routine: Routine, code: u32) {
        self.single_failures.insert(routine, code);
    }

    /// Makes the `n`th memory write, counted from 1 over the life of the fake, fail
    /// with [`TransportError::Timeout`].
    pub fn fail_memory_write(&mut self, n: usize) {
        self.failing_write = Some(n);
    }

    /// Makes `routine` run forever, until the core is halted.
    pub fn hang_routine(&mut self, routine: Routine) {
        self.hangs.insert(routine);
    }

    /// Makes the core lock up when `routine` is started.
    ///
    /// A locked up core cannot be halted anymore.
    pub fn lock_up_on(&mut self, routine: Routine) {
        self.lock_ups.insert(routine);
    }

    /// Flips all bits of RAM reads, as if memory access was broken.
    pub fn corrupt_reads(&mut self) {
        self.corrupt_reads = true;
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> &[TransportCall] {
        &self.calls
    }

    /// All routines started so far, in order.
    pub fn routine_calls(&self) -> &[RoutineCall] {
        &self.routine_calls
    }

    /// The routines started so far, in order.
    pub fn routines(&self) -> Vec<Routine> {
        self.routine_calls.iter().map(|call| call.routine).collect()
    }

    /// Forgets all recorded calls.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
        self.routine_calls.clear();
    }

    /// Returns true if the core is halted.
    pub fn is_halted(&self) -> bool {
        self.status == CoreStatus::Halted
    }

    /// Reads the simulated flash contents, without recording a call.
    pub fn flash_contents(&self, address: u64, len: usize) -> Vec<u8> {
        (address..address + len as u64)
            .map(|address| self.peek(address))
            .collect()
    }

    /// Sets the simulated flash contents, without recording a call.
    pub fn set_flash(&mut self, address: u64, data: &[u8]) {
        for (address, byte) in (address..).zip(data) {
            self.memory.insert(address, *byte);
        }
    }

    fn erased_value(&self, address: u64) -> Option<u8> {
        self.algorithms
            .iter()
            .map(|algorithm| &algorithm.flash_properties)
            .find(|flash| flash.address_range.contains(&address))
            .map(|flash| flash.erased_byte_value)
    }

    fn peek(&self, address: u64) -> u8 {
        match self.memory.get(&address) {
            Some(byte) => *byte,
            None => self.erased_value(address).unwrap_or(0),
        }
    }

    fn calling_convention(&self) -> &'static CallingConvention {
        CallingConvention::for_architecture(self.architecture)
    }

    fn register(&self, register: RegisterId) -> u32 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    /// Finds the algorithm whose image was written at `address`.
    fn detect_algorithm(&mut self, address: u64, data: &[u8]) {
        let header = FlashAlgorithm::header_size(self.architecture) as usize;
        if data.len() < header {
            return;
        }

        let code = &data[header..];
        // The longest matching blob wins, one blob may be a prefix of another.
        let found = self
            .algorithms
            .iter()
            .enumerate()
            .filter(|(_, algorithm)| {
                !algorithm.instructions.is_empty() && code.starts_with(&algorithm.instructions)
            })
            .max_by_key(|(_, algorithm)| algorithm.instructions.len())
            .map(|(index, _)| index);

        if let Some(algorithm) = found {
            self.resident = Some(Resident {
                algorithm,
                code_start: address + header as u64,
            });
        }
    }

    fn routine_at(&self, pc: u64) -> Option<Routine> {
        let resident = self.resident?;
        let algorithm = &self.algorithms[resident.algorithm];
        let offset = pc.checked_sub(resident.code_start)?;

        if offset == algorithm.pc_init {
            Some(Routine::Init)
        } else if offset == algorithm.pc_uninit {
            Some(Routine::Uninit)
        } else if offset == algorithm.pc_program_page {
            Some(Routine::ProgramPage)
        } else if offset == algorithm.pc_erase_sector {
            Some(Routine::EraseSector)
        } else if Some(offset) == algorithm.pc_erase_all {
            Some(Routine::EraseAll)
        } else {
            None
        }
    }

    /// Performs the effect of `routine` on the simulated flash.
    fn execute(&mut self, routine: Routine, arguments: [u32; 4]) {
        let Some(resident) = self.resident else {
            return;
        };
        let flash = self.algorithms[resident.algorithm].flash_properties.clone();

        match routine {
            Routine::Init | Routine::Uninit => {}
            Routine::EraseSector => {
                if let Some(sector) = flash.sector_info(arguments[0] as u64) {
                    let range = sector.address_range();
                    self.memory.retain(|address, _| !range.contains(address));
                }
            }
            Routine::EraseAll => {
                let range = flash.address_range.clone();
                self.memory.retain(|address, _| !range.contains(address));
            }
            Routine::ProgramPage => {
                let [address, len, buffer, _] = arguments;
                for offset in 0..len as u64 {
                    let byte = self.peek(buffer as u64 + offset);
                    let target = address as u64 + offset;
                    // Programming can only clear bits.
                    let programmed = self.peek(target) & byte;
                    self.memory.insert(target, programmed);
                }
            }
        }
    }
}

impl Transport for FakeTransport {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn halt_core(&mut self) -> Result<(), TransportError> {
        self.calls.push(TransportCall::HaltCore);

        if self.status == CoreStatus::LockedUp {
            return Err(anyhow::anyhow!("Core is locked up").into());
        }
        self.status = CoreStatus::Halted;
        Ok(())
    }

    fn resume_core(&mut self) -> Result<(), TransportError> {
        self.calls.push(TransportCall::ResumeCore);

        let cc = self.calling_convention();
        let pc = self.register(cc.program_counter) as u64;
        let Some(routine) = self.routine_at(pc) else {
            return Err(anyhow::anyhow!("No flash algorithm routine at {pc:#010x}").into());
        };

        let arguments = cc.arguments.map(|register| self.register(register));
        self.routine_calls.push(RoutineCall { routine, arguments });

        if self.lock_ups.contains(&routine) {
            self.status = CoreStatus::LockedUp;
            return Ok(());
        }
        if self.hangs.contains(&routine) {
            self.status = CoreStatus::Hung;
            return Ok(());
        }

        let failure = self
            .single_failures
            .remove(&routine)
            .or_else(|| self.failures.get(&routine).copied());
        let result = match failure {
            Some(code) => code,
            None => {
                self.execute(routine, arguments);
                0
            }
        };
        self.registers.insert(cc.result, result);
        self.status = CoreStatus::Running;

        Ok(())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError> {
        self.calls.push(TransportCall::WriteMemory {
            address,
            len: data.len(),
        });

        self.memory_writes += 1;
        if self.failing_write == Some(self.memory_writes) {
            return Err(TransportError::Timeout);
        }

        for (address, byte) in (address..).zip(data) {
            self.memory.insert(address, *byte);
        }
        self.detect_algorithm(address, data);

        Ok(())
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), TransportError> {
        self.calls.push(TransportCall::ReadMemory {
            address,
            len: data.len(),
        });

        for (address, byte) in (address..).zip(data.iter_mut()) {
            *byte = self.peek(address);
            if self.corrupt_reads && self.erased_value(address).is_none() {
                *byte ^= 0xff;
            }
        }

        Ok(())
    }

    fn write_core_register(
        &mut self,
        register: RegisterId,
        value: u32,
    ) -> Result<(), TransportError> {
        self.calls.push(TransportCall::WriteRegister(register, value));

        if self.status != CoreStatus::Halted {
            return Err(anyhow::anyhow!("Core is not halted").into());
        }
        self.registers.insert(register, value);
        Ok(())
    }

    fn read_core_register(&mut self, register: RegisterId) -> Result<u32, TransportError> {
        self.calls.push(TransportCall::ReadRegister(register));
        Ok(self.register(register))
    }

    fn run_to_breakpoint_or_timeout(
        &mut self,
        deadline: Instant,
    ) -> Result<RunOutcome, TransportError> {
        self.calls.push(TransportCall::RunToBreakpoint);

        match self.status {
            CoreStatus::Halted => Ok(RunOutcome::Halted),
            CoreStatus::Running => {
                self.status = CoreStatus::Halted;
                Ok(RunOutcome::Halted)
            }
            CoreStatus::Hung => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                Ok(RunOutcome::Running)
            }
            CoreStatus::LockedUp => Ok(RunOutcome::LockedUp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_register_needs_halted_core() {
        let mut fake = FakeTransport::new(Architecture::Arm);
        assert!(fake.write_core_register(RegisterId(0), 1).is_err());

        fake.halt_core().unwrap();
        fake.write_core_register(RegisterId(0), 1).unwrap();
        assert_eq!(fake.read_core_register(RegisterId(0)).unwrap(), 1);
    }

    #[test]
    fn only_the_chosen_write_fails() {
        let mut fake = FakeTransport::new(Architecture::Arm);
        fake.fail_memory_write(2);

        fake.write_memory(0x2000_0000, &[1]).unwrap();
        assert!(matches!(
            fake.write_memory(0x2000_0000, &[2]),
            Err(TransportError::Timeout)
        ));
        fake.write_memory(0x2000_0000, &[3]).unwrap();

        let mut data = [0];
        fake.read_memory(0x2000_0000, &mut data).unwrap();
        assert_eq!(data, [3]);
    }

    #[test]
    fn resume_outside_of_algorithm_fails() {
        let mut fake = FakeTransport::new(Architecture::Riscv);
        fake.halt_core().unwrap();
        assert!(fake.resume_core().is_err());
    }
}
