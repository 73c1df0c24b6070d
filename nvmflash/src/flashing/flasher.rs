use nvmflash_target::InstructionSet;
use tracing::Level;

use super::{
    DownloadOptions, FlashAlgorithm, FlashBuilder, FlashError, FlashFill, FlashLayout, FlashPage,
    FlashProgress, FlashSector, FlasherState, Routine,
};
use crate::transport::{CallingConvention, RunOutcome, Transport};
use std::time::Instant;
use std::{fmt::Debug, time::Duration};

pub(super) trait Operation {
    fn operation() -> u32;
    fn operation_name() -> &'static str {
        match Self::operation() {
            1 => "Erase",
            2 => "Program",
            3 => "Verify",
            _ => "Unknown Operation",
        }
    }
}

pub(super) struct Erase;

impl Operation for Erase {
    fn operation() -> u32 {
        1
    }
}

pub(super) struct Program;

impl Operation for Program {
    fn operation() -> u32 {
        2
    }
}

pub(super) struct Verify;

impl Operation for Verify {
    fn operation() -> u32 {
        3
    }
}

/// A structure to control the flash of an attached microchip.
///
/// A `Flasher` owns one assembled [`FlashAlgorithm`] and drives it through its
/// routines over an exclusively borrowed [`Transport`]. Every routine call is checked
/// against the current [`FlasherState`] first.
///
/// Work is done in sessions: the algorithm is loaded if needed, initialized for one
/// operation, used, and uninitialized again. The uninit call is attempted even if
/// the session failed or was aborted, and its failure never replaces the session's
/// own result. It is available through [`Flasher::cleanup_error`] instead.
pub struct Flasher<'t> {
    transport: &'t mut dyn Transport,
    flash_algorithm: FlashAlgorithm,
    state: FlasherState,
    options: DownloadOptions,
    cleanup_error: Option<FlashError>,
}

impl Debug for Flasher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flasher")
            .field("flash_algorithm", &self.flash_algorithm.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'t> Flasher<'t> {
    /// Creates a flasher for an assembled algorithm. Nothing is written to the target yet.
    pub fn new(
        transport: &'t mut dyn Transport,
        flash_algorithm: FlashAlgorithm,
        options: &DownloadOptions,
    ) -> Self {
        Self {
            transport,
            flash_algorithm,
            state: FlasherState::Unloaded,
            options: options.clone(),
            cleanup_error: None,
        }
    }

    /// The current state of the flash algorithm on the target.
    pub fn state(&self) -> FlasherState {
        self.state
    }

    /// The first failed uninit call of the last operation, if any.
    ///
    /// An operation like [`Flasher::program`] may run several sessions. Later
    /// failures are only logged and reported as progress events.
    pub fn cleanup_error(&self) -> Option<&FlashError> {
        self.cleanup_error.as_ref()
    }

    /// The assembled flash algorithm driven by this flasher.
    pub fn flash_algorithm(&self) -> &FlashAlgorithm {
        &self.flash_algorithm
    }

    /// Returns true if the algorithm has room for two page buffers.
    pub fn double_buffering_supported(&self) -> bool {
        self.flash_algorithm.page_buffers.len() > 1
    }

    /// Returns true if the algorithm has an `erase_all` routine.
    pub fn is_chip_erase_supported(&self) -> bool {
        self.flash_algorithm.pc_erase_all.is_some()
    }

    fn progress(&self) -> &FlashProgress {
        &self.options.progress
    }

    /// Halts the core and writes the algorithm image to target RAM.
    ///
    /// This is a no-op if the image is already resident.
    pub fn load(&mut self) -> Result<(), FlashError> {
        if self.state.is_resident() {
            tracing::debug!("Flash algorithm already loaded, state is {:?}", self.state);
            return Ok(());
        }

        let result = self.load_image();
        self.state = match result {
            Ok(()) => FlasherState::Loaded,
            Err(_) => FlasherState::Faulted,
        };
        result
    }

    fn load_image(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Initializing the flash algorithm.");
        let algo = &self.flash_algorithm;

        tracing::debug!("Halting core");
        self.transport.halt_core()?;

        // Load flash algorithm code into target RAM.
        let span = tracing::debug_span!("Loading algorithm into RAM", address = algo.load_address)
            .entered();

        self.transport.write_memory(algo.load_address, &algo.image)?;

        drop(span);

        if !self.options.verify_algorithm_load {
            return Ok(());
        }

        let mut data = vec![0; algo.image.len()];
        self.transport.read_memory(algo.load_address, &mut data)?;

        if let Some(offset) = algo
            .image
            .iter()
            .zip(data.iter())
            .position(|(original, read_back)| original != read_back)
        {
            tracing::error!(
                "Failed to verify flash algorithm. Data mismatch at address {:#010x}",
                algo.load_address + offset as u64
            );
            tracing::error!("Original: {:x?}", &algo.image);
            tracing::error!("Readback: {:x?}", &data);

            return Err(FlashError::FlashAlgorithmNotLoaded);
        }

        tracing::debug!("RAM contents match flashing algo blob.");

        Ok(())
    }

    /// Runs one init/uninit session for operation `O` around `f`.
    pub(super) fn run_session<O: Operation, T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 't, O>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.load()?;

        tracing::debug!("Preparing Flasher for operation {}", O::operation_name());
        let result = match self.init(O::operation()) {
            Ok(()) => {
                let mut active = ActiveFlasher::<O> {
                    flasher: &mut *self,
                    _operation: core::marker::PhantomData,
                };
                f(&mut active)
            }
            Err(error) => Err(error),
        };

        match &result {
            Ok(_) | Err(FlashError::Aborted) => {}
            Err(_) => self.state = FlasherState::Faulted,
        }

        if self.state.needs_uninit() {
            let faulted = self.state == FlasherState::Faulted;

            if faulted {
                // A routine may still be running on the core.
                if let Err(error) = self.transport.halt_core() {
                    tracing::debug!("Halting the core before uninit failed: {}", error);
                }
            }

            if let Err(error) = self.uninit(O::operation()) {
                tracing::warn!(
                    "Uninit of flash algorithm '{}' failed: {}",
                    self.flash_algorithm.name,
                    error
                );
                self.progress()
                    .uninit_failed(&self.flash_algorithm.name, error.to_string());
                if self.cleanup_error.is_none() {
                    self.cleanup_error = Some(error);
                }
            }

            if faulted {
                self.state = FlasherState::Faulted;
            }
        }

        result
    }

    pub(super) fn run_erase<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 't, Erase>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_session(f)
    }

    pub(super) fn run_program<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 't, Program>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_session(f)
    }

    pub(super) fn run_verify<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 't, Verify>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_session(f)
    }

    /// Erases the whole flash with the `erase_all` routine of the algorithm.
    pub fn run_erase_all(&mut self) -> Result<(), FlashError> {
        self.cleanup_error = None;
        if !self.is_chip_erase_supported() {
            return Err(FlashError::UnsupportedOperation {
                algorithm: self.flash_algorithm.name.clone(),
                operation: "erase_all",
            });
        }

        self.progress().started_erasing();
        let result = self.run_erase(|active| active.erase_all());

        if result.is_ok() {
            self.progress().finished_erasing();
        } else {
            self.progress().failed_erasing();
        }

        result
    }

    /// Erases the given sectors, in the given order, in one session.
    pub fn erase_sectors(&mut self, sectors: &[FlashSector]) -> Result<(), FlashError> {
        self.cleanup_error = None;
        self.erase_sector_list(sectors)
    }

    fn erase_sector_list(&mut self, sectors: &[FlashSector]) -> Result<(), FlashError> {
        if sectors.is_empty() {
            return Ok(());
        }

        self.progress().started_erasing();

        let mut t = Instant::now();
        let result = self.run_erase(|active| {
            for sector in sectors {
                active.erase_sector(sector.address())?;
                active.progress().sector_erased(sector.size(), t.elapsed());

                t = Instant::now();
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress().finished_erasing();
        } else {
            self.progress().failed_erasing();
        }

        result
    }

    /// Program the contents of given `FlashBuilder` to the flash.
    ///
    /// If `restore_unwritten_bytes` is `true`, all bytes of a sector,
    /// that are not to be written during flashing will be read from the flash first
    /// and written again once the sector is erased.
    ///
    /// Returns the layout which was programmed.
    pub fn program(
        &mut self,
        flash_builder: &FlashBuilder,
        restore_unwritten_bytes: bool,
        enable_double_buffering: bool,
        skip_erasing: bool,
    ) -> Result<FlashLayout, FlashError> {
        tracing::debug!("Starting program procedure.");
        self.cleanup_error = None;
        // Convert the list of flash operations into flash sectors and pages.
        let mut flash_layout = flash_builder.build_sectors_and_pages(
            &self.flash_algorithm.flash_properties,
            restore_unwritten_bytes,
        )?;
        if flash_layout.pages().is_empty() {
            tracing::debug!("Nothing to program.");
            return Ok(flash_layout);
        }
        self.progress().initialized(flash_layout.clone());

        tracing::debug!("Double Buffering enabled: {:?}", enable_double_buffering);
        tracing::debug!(
            "Restoring unwritten bytes enabled: {:?}",
            restore_unwritten_bytes
        );

        // Read all fill areas from the flash.
        self.progress().started_filling();

        if restore_unwritten_bytes && !flash_layout.fills().is_empty() {
            if let Err(error) = self.fill_pages(&mut flash_layout) {
                self.progress().failed_filling();
                return Err(error);
            }
        }

        // We successfully finished filling.
        self.progress().finished_filling();

        // Skip erase if necessary
        if !skip_erasing {
            // Erase all necessary sectors
            self.erase_sector_list(flash_layout.sectors())?;
        }

        // Flash all necessary pages.
        if self.double_buffering_supported() && enable_double_buffering {
            self.program_double_buffer(&flash_layout)?;
        } else {
            self.program_simple(&flash_layout)?;
        };

        Ok(flash_layout)
    }

    /// Reads the current flash contents of all fills into their pages.
    fn fill_pages(&mut self, flash_layout: &mut FlashLayout) -> Result<(), FlashError> {
        let fills = flash_layout.fills().to_vec();
        let pages = flash_layout.pages_mut();

        self.run_verify(|active| {
            for fill in &fills {
                let t = Instant::now();
                let page = &mut pages[fill.page_index()];
                active.fill_page(page, fill)?;
                active.progress().page_filled(fill.size(), t.elapsed());
            }
            Ok(())
        })
    }

    /// Programs the pages given in `flash_layout` into the flash.
    fn program_simple(&mut self, flash_layout: &FlashLayout) -> Result<(), FlashError> {
        self.progress().started_programming();

        let mut t = Instant::now();
        let result = self.run_program(|active| {
            for page in flash_layout.pages() {
                active.program_page(page.address(), page.data())?;
                active.progress().page_programmed(page.size(), t.elapsed());

                t = Instant::now();
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress().finished_programming();
        } else {
            self.progress().failed_programming();
        }

        result
    }

    /// Flash a program using double buffering.
    ///
    /// This uses two buffers to increase the flash speed.
    /// While the data from one buffer is programmed, the
    /// data for the next page is already downloaded
    /// into the next buffer.
    ///
    /// This is only possible if the RAM is large enough to
    /// fit at least two page buffers. See [Flasher::double_buffering_supported].
    fn program_double_buffer(&mut self, flash_layout: &FlashLayout) -> Result<(), FlashError> {
        let mut current_buf = 0;
        self.progress().started_programming();

        let mut t = Instant::now();
        let result = self.run_program(|active| {
            let mut in_flight: Option<&FlashPage> = None;
            for page in flash_layout.pages() {
                // At the start of each loop cycle load the next page buffer into RAM.
                active.load_page_buffer(page.data(), current_buf)?;

                // Then wait for the active RAM -> Flash copy process to finish.
                if let Some(previous) = in_flight.take() {
                    active.finish_program_page(previous.address())?;
                    active.progress().page_programmed(previous.size(), t.elapsed());
                    t = Instant::now();
                }

                // Start the next copy process.
                active.start_program_page_with_buffer(page.address(), current_buf)?;
                in_flight = Some(page);

                // Swap the buffers
                current_buf = 1 - current_buf;
            }

            if let Some(previous) = in_flight {
                active.finish_program_page(previous.address())?;
                active.progress().page_programmed(previous.size(), t.elapsed());
            }

            Ok(())
        });

        if result.is_ok() {
            self.progress().finished_programming();
        } else {
            self.progress().failed_programming();
        }

        result
    }

    /// Reads back all data of `flash_builder` and compares it.
    pub fn verify(&mut self, flash_builder: &FlashBuilder) -> Result<(), FlashError> {
        self.cleanup_error = None;
        self.progress().started_verifying();

        let result = self.run_verify(|active| {
            for (address, data) in flash_builder.data_blocks() {
                let mut read_back = vec![0; data.len()];
                active.read(address, &mut read_back)?;

                if let Some(offset) = data
                    .iter()
                    .zip(read_back.iter())
                    .position(|(expected, actual)| expected != actual)
                {
                    let address = address + offset as u64;
                    tracing::error!("Verification failed at address {:#010x}", address);
                    return Err(FlashError::Verify { address });
                }
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress().finished_verifying();
        } else {
            self.progress().failed_verifying();
        }

        result
    }

    #[tracing::instrument(name = "Call to flash algorithm init", skip(self))]
    fn init(&mut self, operation: u32) -> Result<(), FlashError> {
        let algo = &self.flash_algorithm;
        let address = algo.flash_properties.address_range.start;

        let registers = Registers {
            pc: into_reg(algo.pc_init)?,
            r0: Some(into_reg(address)?),
            r1: Some(self.options.clock.unwrap_or(0)),
            r2: Some(operation),
            r3: None,
        };

        self.call_routine(Routine::Init, &registers, true, None)
    }

    fn uninit(&mut self, operation: u32) -> Result<(), FlashError> {
        tracing::debug!("Running uninit routine.");

        let registers = Registers {
            pc: into_reg(self.flash_algorithm.pc_uninit)?,
            r0: Some(operation),
            r1: None,
            r2: None,
            r3: None,
        };

        self.call_routine(Routine::Uninit, &registers, false, None)
    }

    fn call_routine(
        &mut self,
        routine: Routine,
        registers: &Registers,
        init: bool,
        address: Option<u64>,
    ) -> Result<(), FlashError> {
        self.start_routine(routine, registers, init)?;
        self.finish_routine(routine, address)
    }

    /// Checks the state, enters the busy state and starts the routine on the core.
    fn start_routine(
        &mut self,
        routine: Routine,
        registers: &Registers,
        init: bool,
    ) -> Result<(), FlashError> {
        let transition = routine.transition();
        if !transition.from.contains(&self.state) {
            return Err(FlashError::InvalidState {
                routine,
                state: self.state,
            });
        }

        if routine != Routine::Uninit && self.options.is_aborted() {
            tracing::info!("Aborting before calling {}", routine);
            return Err(FlashError::Aborted);
        }

        self.state = transition.busy;
        if let Err(error) = self.call_function(registers, init) {
            self.state = FlasherState::Faulted;
            return Err(error);
        }

        Ok(())
    }

    /// Waits for a started routine and settles the state according to its result.
    fn finish_routine(&mut self, routine: Routine, address: Option<u64>) -> Result<(), FlashError> {
        let timeout = routine.timeout(&self.flash_algorithm, &self.options);

        match self.wait_for_completion(routine, timeout) {
            Ok(0) => {
                self.state = routine.transition().to;
                Ok(())
            }
            Ok(code) => {
                tracing::debug!("Routine {} returned {:#x}", routine, code);
                self.state = FlasherState::Faulted;
                Err(routine.failure(code, address))
            }
            Err(error) => {
                self.state = FlasherState::Faulted;
                Err(error)
            }
        }
    }

    fn call_function(&mut self, registers: &Registers, init: bool) -> Result<(), FlashError> {
        tracing::debug!("Calling routine {:?}, init={})", &registers, init);

        let algo = &self.flash_algorithm;
        let regs = CallingConvention::for_architecture(self.transport.architecture());

        // Thumb code has to return to an odd address.
        let return_address = if self.transport.instruction_set() == InstructionSet::Thumb2 {
            algo.load_address + 1
        } else {
            algo.load_address
        };

        let registers = [
            (regs.program_counter, Some(registers.pc)),
            (regs.argument_register(0), registers.r0),
            (regs.argument_register(1), registers.r1),
            (regs.argument_register(2), registers.r2),
            (regs.argument_register(3), registers.r3),
            (
                regs.static_base,
                if init {
                    Some(into_reg(algo.static_base)?)
                } else {
                    None
                },
            ),
            (
                regs.stack_pointer,
                if init {
                    Some(into_reg(algo.begin_stack)?)
                } else {
                    None
                },
            ),
            (regs.return_address, Some(into_reg(return_address)?)),
        ];

        for (register, value) in registers {
            if let Some(v) = value {
                self.transport.write_core_register(register, v)?;

                if tracing::enabled!(Level::TRACE) {
                    let value = self.transport.read_core_register(register)?;

                    tracing::trace!(
                        "content of register {}: 0x{:08x} should be: 0x{:08x}",
                        register,
                        value,
                        v
                    );
                }
            }
        }

        // Resume target operation.
        self.transport.resume_core()?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn wait_for_completion(&mut self, routine: Routine, timeout: Duration) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");
        let regs = CallingConvention::for_architecture(self.transport.architecture());
        let poll_interval = Duration::from_millis(self.options.poll_interval_ms.max(1));

        // Wait until halted state is active again.
        let deadline = Instant::now() + timeout;

        loop {
            let step = (Instant::now() + poll_interval).min(deadline);
            match self.transport.run_to_breakpoint_or_timeout(step)? {
                RunOutcome::Halted => break,
                RunOutcome::LockedUp => {
                    tracing::error!("Core locked up while running {}", routine);
                    return Err(FlashError::CoreLockedUp(routine));
                }
                RunOutcome::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!("Routine {} did not return within {:?}", routine, timeout);
                        if let Err(error) = self.transport.halt_core() {
                            tracing::debug!("Halting the core after the timeout failed: {}", error);
                        }
                        return Err(FlashError::OperationTimeout(routine));
                    }
                    std::thread::sleep(step.saturating_duration_since(now));
                }
            }
        }

        let r = self.transport.read_core_register(regs.result)?;
        Ok(r)
    }
}

struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn into_reg(val: u64) -> Result<u32, FlashError> {
    let reg_value: u32 = val
        .try_into()
        .map_err(|_| FlashError::RegisterValueNotSupported(val))?;

    Ok(reg_value)
}

/// An initialized flasher, for the duration of one session of operation `O`.
pub(super) struct ActiveFlasher<'a, 't, O: Operation> {
    flasher: &'a mut Flasher<'t>,
    _operation: core::marker::PhantomData<O>,
}

impl<O: Operation> ActiveFlasher<'_, '_, O> {
    pub(super) fn progress(&self) -> &FlashProgress {
        self.flasher.progress()
    }

    fn algorithm(&self) -> &FlashAlgorithm {
        &self.flasher.flash_algorithm
    }
}

impl ActiveFlasher<'_, '_, Erase> {
    pub(super) fn erase_all(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Erasing entire chip.");

        let Some(pc_erase_all) = self.algorithm().pc_erase_all else {
            return Err(FlashError::UnsupportedOperation {
                algorithm: self.algorithm().name.clone(),
                operation: "erase_all",
            });
        };

        let registers = Registers {
            pc: into_reg(pc_erase_all)?,
            r0: None,
            r1: None,
            r2: None,
            r3: None,
        };
        self.flasher
            .call_routine(Routine::EraseAll, &registers, false, None)
    }

    pub(super) fn erase_sector(&mut self, address: u64) -> Result<(), FlashError> {
        tracing::info!("Erasing sector at address 0x{:08x}", address);
        let t1 = Instant::now();

        let registers = Registers {
            pc: into_reg(self.algorithm().pc_erase_sector)?,
            r0: Some(into_reg(address)?),
            r1: None,
            r2: None,
            r3: None,
        };
        self.flasher
            .call_routine(Routine::EraseSector, &registers, false, Some(address))?;

        tracing::info!("Done erasing sector. This took {:?}", t1.elapsed());
        Ok(())
    }
}

impl ActiveFlasher<'_, '_, Program> {
    pub(super) fn program_page(&mut self, address: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let t1 = Instant::now();

        tracing::info!(
            "Flashing page at address {:#010x} with size: {}",
            address,
            bytes.len()
        );

        // Transfer the bytes to RAM.
        self.load_page_buffer(bytes, 0)?;
        self.start_program_page_with_buffer(address, 0)?;
        self.finish_program_page(address)?;

        tracing::info!("Flashing took: {:?}", t1.elapsed());
        Ok(())
    }

    pub(super) fn start_program_page_with_buffer(
        &mut self,
        address: u64,
        buffer_number: usize,
    ) -> Result<(), FlashError> {
        let algo = self.algorithm();
        let buffer = algo.page_buffers[buffer_number % algo.page_buffers.len()];

        let registers = Registers {
            pc: into_reg(algo.pc_program_page)?,
            r0: Some(into_reg(address)?),
            r1: Some(algo.flash_properties.page_size),
            r2: Some(into_reg(buffer)?),
            r3: None,
        };
        self.flasher
            .start_routine(Routine::ProgramPage, &registers, false)
    }

    pub(super) fn finish_program_page(&mut self, address: u64) -> Result<(), FlashError> {
        self.flasher
            .finish_routine(Routine::ProgramPage, Some(address))
    }

    pub(super) fn load_page_buffer(
        &mut self,
        bytes: &[u8],
        buffer_number: usize,
    ) -> Result<(), FlashError> {
        let algo = self.algorithm();
        let buffer = algo.page_buffers[buffer_number % algo.page_buffers.len()];

        let t1 = Instant::now();
        self.flasher.transport.write_memory(buffer, bytes)?;

        tracing::trace!(
            "Took {:?} to download {} byte page into ram",
            t1.elapsed(),
            bytes.len()
        );

        Ok(())
    }
}

impl ActiveFlasher<'_, '_, Verify> {
    pub(super) fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), FlashError> {
        self.flasher.transport.read_memory(address, data)?;
        Ok(())
    }

    /// Fills the bytes of `page` covered by `fill` with the current flash contents.
    pub(super) fn fill_page(&mut self, page: &mut FlashPage, fill: &FlashFill) -> Result<(), FlashError> {
        let page_offset = (fill.address() - page.address()) as usize;
        let page_slice = &mut page.data_mut()[page_offset..page_offset + fill.size() as usize];
        self.read(fill.address(), page_slice)
    }
}
