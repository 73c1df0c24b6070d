//! Target descriptions: the catalogue of chip families and the resolved view of one variant.

mod registry;
mod target;

pub use nvmflash_target::{
    Architecture, Chip, ChipFamily, Core, CoreType, FlashProperties, MemoryRange, MemoryRegion,
    NvmRegion, RamRegion, RawFlashAlgorithm, SectorDescription, TargetDescriptionSource,
};
pub use registry::{Registry, RegistryError};
pub use target::Target;

pub(crate) use target::algorithm_at;
