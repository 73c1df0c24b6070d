use std::ops::Range;
use std::sync::Arc;

use nvmflash_target::{
    Architecture, Chip, Core, MemoryRange, MemoryRegion, RamRegion, RawFlashAlgorithm,
    TargetDescriptionSource,
};

use crate::flashing::{FlashError, FlashLoader};

/// This describes a complete target with a fixed chip model and variant.
///
/// Flash algorithm definitions are shared with the [`Registry`](super::Registry) and
/// all other targets of the same family.
#[derive(Debug, Clone)]
pub struct Target {
    /// The name of the target.
    pub name: String,
    /// The cores of the target.
    pub cores: Vec<Core>,
    /// The memory map of the target.
    pub memory_map: Vec<MemoryRegion>,
    /// The flash algorithms of the target, in the order the variant declares them.
    pub flash_algorithms: Vec<Arc<RawFlashAlgorithm>>,
    /// Source of the target description.
    pub source: TargetDescriptionSource,
}

impl Target {
    pub(super) fn new(
        chip: &Chip,
        flash_algorithms: Vec<Arc<RawFlashAlgorithm>>,
        source: TargetDescriptionSource,
    ) -> Self {
        Target {
            name: chip.name.clone(),
            cores: chip.cores.clone(),
            memory_map: chip.memory_map.clone(),
            flash_algorithms,
            source,
        }
    }

    /// Returns the core with the given name.
    pub fn core(&self, name: &str) -> Result<&Core, FlashError> {
        self.cores
            .iter()
            .find(|core| core.name == name)
            .ok_or_else(|| FlashError::UnknownCore {
                target: self.name.clone(),
                core: name.to_string(),
            })
    }

    /// The architecture of the given core.
    pub fn architecture(&self, core: &str) -> Result<Architecture, FlashError> {
        Ok(self.core(core)?.core_type.architecture())
    }

    /// The memory regions accessible by `core`, in ascending address order.
    pub fn regions_for(&self, core: &str) -> Vec<&MemoryRegion> {
        let mut regions: Vec<_> = self
            .memory_map
            .iter()
            .filter(|region| region.accessible_by(core))
            .collect();
        regions.sort_by_key(|region| region.address_range().start);
        regions
    }

    /// The flash algorithms which run on `core`.
    pub fn algorithms_for(&self, core: &str) -> Vec<Arc<RawFlashAlgorithm>> {
        self.flash_algorithms
            .iter()
            .filter(|algorithm| algorithm.runs_on(core))
            .cloned()
            .collect()
    }

    /// Finds the flash algorithm of `core` which covers the whole `range`.
    ///
    /// If several algorithms cover the range, the one marked as default is used,
    /// otherwise the one declared first.
    pub fn algorithm_for_range(
        &self,
        core: &str,
        range: Range<u64>,
    ) -> Result<Arc<RawFlashAlgorithm>, FlashError> {
        self.core(core)?;

        let algorithms = self.algorithms_for(core);
        preferred_algorithm(
            algorithms
                .iter()
                .filter(|algorithm| algorithm.flash_properties.address_range.contains_range(&range)),
        )
        .cloned()
        .ok_or_else(|| FlashError::NoAlgorithmForRange {
            core: core.to_string(),
            range,
        })
    }

    /// The RAM region a flash algorithm for `core` is loaded into.
    ///
    /// This is the first region owned by the core which allows writing and executing code.
    pub fn ram_region_for(&self, core: &str) -> Result<&RamRegion, FlashError> {
        self.core(core)?;

        let ram = self
            .regions_for(core)
            .into_iter()
            .filter_map(MemoryRegion::as_ram_region)
            .find(|ram| ram.can_run_code())
            .ok_or_else(|| FlashError::NoRamDefined {
                target: self.name.clone(),
                core: core.to_string(),
            })?;

        tracing::debug!("Chosen RAM to run the algo: {:x?}", ram);
        Ok(ram)
    }

    /// The start of the boot memory of the target, if it has one.
    pub fn boot_address(&self) -> Option<u64> {
        self.memory_map
            .iter()
            .filter_map(MemoryRegion::as_nvm_region)
            .find(|nvm| nvm.is_boot_memory())
            .map(|nvm| nvm.range.start)
    }

    /// Creates a [`FlashLoader`] for this target.
    pub fn flash_loader(&self) -> FlashLoader {
        FlashLoader::new(self.boot_address())
    }
}

/// Picks the algorithm marked as default, or the first one.
fn preferred_algorithm<'a>(
    mut algorithms: impl Iterator<Item = &'a Arc<RawFlashAlgorithm>> + Clone,
) -> Option<&'a Arc<RawFlashAlgorithm>> {
    algorithms
        .clone()
        .find(|algorithm| algorithm.default)
        .or_else(|| algorithms.next())
}

/// Picks the algorithm responsible for `address`, and the end of the run of
/// addresses it stays responsible for.
///
/// The run ends with the flash of the algorithm, or where another algorithm
/// starts. From there on the choice has to be made again.
pub(crate) fn algorithm_at(
    algorithms: &[Arc<RawFlashAlgorithm>],
    address: u64,
) -> Option<(&Arc<RawFlashAlgorithm>, u64)> {
    let algorithm = preferred_algorithm(
        algorithms
            .iter()
            .filter(|a| a.flash_properties.address_range.contains(&address)),
    )?;

    let end = algorithms
        .iter()
        .filter(|other| !Arc::ptr_eq(other, algorithm))
        .map(|other| other.flash_properties.address_range.start)
        .filter(|start| *start > address)
        .fold(algorithm.flash_properties.address_range.end, u64::min);

    Some((algorithm, end))
}
