use ihex::Record;
use std::io::{Read, Seek, SeekFrom};

use super::builder::{FlashBuilder, FlashPlan};
use super::{BinOptions, DownloadOptions, FileDownloadError, FlashAlgorithm, FlashError, Flasher};
use crate::config::Target;
use crate::transport::Transport;

/// `FlashLoader` is a struct which manages the flashing of any chunks of data onto any sections of flash.
///
/// Use [add_data()](FlashLoader::add_data) to add a chunk of data.
/// Once you are done adding all your data, use `commit()` to flash the data.
/// The flash loader will make sure to select the appropriate flash algorithm for the right data chunks.
/// Data chunks may cross the boundary between two flash algorithms.
#[derive(Debug, Clone, Default)]
pub struct FlashLoader {
    builder: FlashBuilder,

    /// Where binary data without a base address is placed.
    boot_address: Option<u64>,
}

impl FlashLoader {
    /// Create a new flash loader.
    ///
    /// `boot_address` is used for binary data without an explicit base address.
    pub fn new(boot_address: Option<u64>) -> Self {
        Self {
            builder: FlashBuilder::new(),
            boot_address,
        }
    }

    /// Stages a chunk of data to be programmed.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        tracing::debug!(
            "Adding data at address {:#010x} with size {} bytes",
            address,
            data.len()
        );

        self.builder.add_data(address, data)
    }

    /// The data staged so far.
    pub fn builder(&self) -> &FlashBuilder {
        &self.builder
    }

    /// Reads the data from the binary file and adds it to the loader without splitting it into flash instructions yet.
    pub fn load_bin_data<T: Read + Seek>(
        &mut self,
        file: &mut T,
        options: BinOptions,
    ) -> Result<(), FileDownloadError> {
        // Skip the specified bytes.
        file.seek(SeekFrom::Start(u64::from(options.skip)))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // If no base address is specified use the start of the boot memory.
        let address = options.base_address.or(self.boot_address).unwrap_or(0);
        self.add_data(address, &buf)?;

        Ok(())
    }

    /// Reads the HEX data segments and adds them as loadable data blocks to the loader.
    /// This does not create and flash loader instructions yet.
    pub fn load_hex_data<T: Read>(&mut self, file: &mut T) -> Result<(), FileDownloadError> {
        let mut base_address = 0;

        let mut data = String::new();
        file.read_to_string(&mut data)?;

        for record in ihex::Reader::new(&data) {
            match record? {
                Record::Data { offset, value } => {
                    let offset = base_address + offset as u64;
                    self.add_data(offset, &value)?;
                }
                Record::EndOfFile => (),
                Record::ExtendedSegmentAddress(address) => {
                    base_address = (address as u64) * 16;
                }
                Record::StartSegmentAddress { .. } => (),
                Record::ExtendedLinearAddress(address) => {
                    base_address = (address as u64) << 16;
                }
                Record::StartLinearAddress(_) => (),
            };
        }
        Ok(())
    }

    /// Splits the staged data by the flash algorithms of `core` which are responsible for it.
    ///
    /// This is a pure computation.
    pub fn plan(&self, target: &Target, core: &str) -> Result<FlashPlan, FlashError> {
        FlashPlan::new(target, core, &self.builder)
    }

    /// Writes all the stored data chunks to flash.
    ///
    /// Everything which can fail without touching the target is checked first: the plan,
    /// the RAM layout of every algorithm, and the page layout of every phase. Then every
    /// phase is erased and programmed in its own sessions.
    pub fn commit(
        &self,
        target: &Target,
        core: &str,
        transport: &mut dyn Transport,
        options: &DownloadOptions,
    ) -> Result<(), FlashError> {
        tracing::debug!("Committing FlashLoader!");

        let plan = self.plan(target, core)?;
        if plan.is_empty() {
            tracing::debug!("No data to flash.");
            return Ok(());
        }

        let architecture = target.architecture(core)?;
        let ram = target.ram_region_for(core)?;

        let mut phases = Vec::with_capacity(plan.phases().len());
        for phase in plan.phases() {
            let algorithm =
                FlashAlgorithm::assemble_from_raw(phase.algorithm().clone(), ram, architecture)?;

            // Fails early if any data is not covered by the flash.
            phase.builder().build_sectors_and_pages(
                &algorithm.flash_properties,
                options.keep_unwritten_bytes,
            )?;

            phases.push((algorithm, phase.builder()));
        }

        if options.dry_run {
            tracing::info!("Skipping programming, dry run!");
            return Ok(());
        }

        for (algorithm, builder) in phases {
            tracing::debug!("Flashing with algorithm {}", algorithm.name);

            let mut flasher = Flasher::new(&mut *transport, algorithm, options);

            let mut skip_erasing = options.skip_erase;
            if options.do_chip_erase && !skip_erasing {
                if flasher.is_chip_erase_supported() {
                    tracing::debug!("    Doing chip erase...");
                    flasher.run_erase_all()?;
                    skip_erasing = true;
                } else {
                    tracing::warn!(
                        "Chip erase is not supported by flash algorithm {}, erasing sectors instead.",
                        flasher.flash_algorithm().name
                    );
                }
            }

            flasher.program(
                builder,
                options.keep_unwritten_bytes,
                !options.disable_double_buffering,
                skip_erasing,
            )?;

            if options.verify {
                flasher.verify(builder)?;
            }
        }

        Ok(())
    }
}
