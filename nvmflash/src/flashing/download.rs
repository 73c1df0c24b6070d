use std::{
    fs::File,
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use nvmflash_target::FlashProperties;
use serde::{Deserialize, Serialize};

use super::{FlashError, FlashProgress};
use crate::config::{Registry, Target};
use crate::transport::Transport;

/// Extended options for flashing a binary file.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinOptions {
    /// The address in memory where the binary will be put at.
    ///
    /// If `None`, the start of the boot memory of the target is used.
    pub base_address: Option<u64>,
    /// The number of bytes to skip at the start of the binary file.
    pub skip: u32,
}

/// A finite list of all the available binary formats the loader understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Format {
    /// Marks a file in binary format. This means that the file contains the contents of the flash 1:1.
    /// [BinOptions] can be used to define the location in flash where the file contents should be put at.
    /// Additionally using the same config struct, you can skip the first N bytes of the binary file to have them not put into the flash.
    Bin(BinOptions),
    /// Marks a file in [Intel HEX](https://en.wikipedia.org/wiki/Intel_HEX) format.
    Hex,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase()[..] {
            "bin" | "binary" => Ok(Format::Bin(BinOptions::default())),
            "hex" | "ihex" | "intelhex" => Ok(Format::Hex),
            _ => Err(format!("Format '{s}' is unknown.")),
        }
    }
}

/// A finite list of all the errors that can occur when flashing a given file.
///
/// This includes corrupt file issues,
/// OS permission issues as well as chip connectivity and memory boundary issues.
#[derive(Debug, thiserror::Error)]
pub enum FileDownloadError {
    /// An error with the actual flashing procedure has occured.
    #[error("Error while flashing")]
    Flash(#[from] FlashError),
    /// Reading and decoding the IHEX file has failed due to the given error.
    #[error("Could not read ihex format")]
    IhexRead(#[from] ihex::ReaderError),
    /// An IO error has occured while reading the firmware file.
    #[error("I/O error")]
    IO(#[from] std::io::Error),
    /// The target variant or core could not be resolved.
    #[error("Could not resolve the target")]
    Registry(#[from] crate::config::RegistryError),
}

/// How long the `erase_all` routine may run.
///
/// Chip descriptions only carry a per-sector erase time, so the bound for a
/// whole-chip erase has to be derived from it or given explicitly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EraseAllTimeout {
    /// A fixed number of milliseconds.
    Fixed(u32),
    /// The erase time of a single sector.
    SectorTimeout,
    /// The erase time of a single sector, multiplied by the number of sectors of the flash.
    #[default]
    ScaledBySectorCount,
}

impl EraseAllTimeout {
    /// Resolves the policy against the properties of one flash.
    pub fn resolve(&self, flash: &FlashProperties) -> Duration {
        let sector_timeout = flash.erase_sector_timeout as u64;
        let millis = match self {
            EraseAllTimeout::Fixed(millis) => *millis as u64,
            EraseAllTimeout::SectorTimeout => sector_timeout,
            EraseAllTimeout::ScaledBySectorCount => {
                sector_timeout.saturating_mul(flash.iter_sectors().count().max(1) as u64)
            }
        };
        Duration::from_millis(millis)
    }
}

/// A handle to abort a running flash operation from another thread or from a progress callback.
///
/// The flag is checked before every routine call. An aborted session still runs the
/// uninit routine of the flash algorithm before it returns [`FlashError::Aborted`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Creates a new handle, which is not aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests all operations using this handle to stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true if an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for downloading data onto a target chip.
///
/// This struct can be deserialized, so the tuning values can live in a configuration
/// file. The progress and abort handles are runtime only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// An optional progress reporter.
    #[serde(skip)]
    pub progress: FlashProgress,
    /// An optional handle to abort the operation.
    #[serde(skip)]
    pub abort: Option<AbortHandle>,
    /// If `keep_unwritten_bytes` is `true`, erased portions of the flash that are not overwritten by the data
    /// are restored afterwards, such that the old contents are untouched.
    ///
    /// This is necessary because the flash can only be erased in sectors. If only parts of the erased sector are written thereafter,
    /// instead of the full sector, the excessively erased bytes wont match the contents before the erase which might not be intuitive
    /// to the user or even worse, result in unexpected behavior if those contents contain important data.
    pub keep_unwritten_bytes: bool,
    /// Perform a dry run. This prepares everything for flashing, but does not write anything to flash.
    pub dry_run: bool,
    /// If this flag is set to true, the flash algorithm's `erase_all` routine is used instead of erasing
    /// single sectors, where the algorithm has one.
    /// This is often faster than erasing a lot of single sectors.
    /// So if you do not need the old contents of the flash, this is a good option.
    pub do_chip_erase: bool,
    /// If the chip was pre-erased with external erasers, this flag can set to true to skip erasing.
    /// It may be useful for mass production.
    pub skip_erase: bool,
    /// Program every page through a single RAM buffer.
    ///
    /// By default, two page buffers are used when the RAM of the target has room for them,
    /// so the next page is transferred while the previous one is programmed.
    pub disable_double_buffering: bool,
    /// After flashing, read back all the flashed data to verify it has been written correctly.
    pub verify: bool,
    /// Read back the flash algorithm after loading it into RAM.
    pub verify_algorithm_load: bool,
    /// The clock frequency passed to the init routine, in Hz. `0` is passed if unset.
    pub clock: Option<u32>,
    /// How long the `init` and `uninit` routines may run, in milliseconds.
    pub init_timeout_ms: u64,
    /// The interval in which the core status is polled while a routine runs, in milliseconds.
    pub poll_interval_ms: u64,
    /// How long the `erase_all` routine may run.
    pub erase_all_timeout: EraseAllTimeout,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            progress: FlashProgress::default(),
            abort: None,
            keep_unwritten_bytes: false,
            dry_run: false,
            do_chip_erase: false,
            skip_erase: false,
            disable_double_buffering: false,
            verify: false,
            verify_algorithm_load: true,
            clock: None,
            init_timeout_ms: 2000,
            poll_interval_ms: 1,
            erase_all_timeout: EraseAllTimeout::default(),
        }
    }
}

impl DownloadOptions {
    /// DownloadOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortHandle::is_aborted)
    }
}

/// Erases the sectors covering `[address, address + data.len())` and programs `data` there.
///
/// All lookups and the complete plan are done before the transport is touched. An empty
/// `data` slice is not an error and results in no transport calls at all.
pub fn erase_and_program(
    registry: &Registry,
    variant: &str,
    core: &str,
    transport: &mut dyn Transport,
    address: u64,
    data: &[u8],
    options: &DownloadOptions,
) -> Result<(), FlashError> {
    let target = lookup_target(registry, variant)?;

    let mut loader = target.flash_loader();
    loader.add_data(address, data)?;
    loader.commit(&target, core, transport, options)
}

/// Resolves `variant`, before anything else happens.
pub(super) fn lookup_target(registry: &Registry, variant: &str) -> Result<Target, FlashError> {
    registry
        .get_target_by_name(variant)
        .map_err(|_| FlashError::UnknownVariant(variant.to_string()))
}

/// Downloads a file of given `format` at `path` to the flash of `core` of the target `variant`.
///
/// This will ensure that memory boundaries are honored and does erasing and programming of the flash for you.
pub fn download_file(
    registry: &Registry,
    variant: &str,
    core: &str,
    transport: &mut dyn Transport,
    path: impl AsRef<Path>,
    format: Format,
    options: &DownloadOptions,
) -> Result<(), FileDownloadError> {
    let target = registry.get_target_by_name(variant)?;
    let mut file = File::open(path)?;
    let mut loader = target.flash_loader();

    match format {
        Format::Bin(bin_options) => loader.load_bin_data(&mut file, bin_options)?,
        Format::Hex => loader.load_hex_data(&mut file)?,
    }

    loader
        .commit(&target, core, transport, options)
        .map_err(FileDownloadError::Flash)
}
