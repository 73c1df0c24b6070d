use std::ops::Range;
use std::sync::Arc;

use nvmflash_target::{MemoryRange, RawFlashAlgorithm};

use super::download::lookup_target;
use super::{DownloadOptions, FlashAlgorithm, FlashError, FlashSector, Flasher};
use crate::config::{algorithm_at, Registry, Target};
use crate::transport::Transport;

/// Mass-erase all flash of `core`, using the `erase_all` routine of its flash algorithms.
///
/// Where algorithms overlap, only the preferred one is used. If any of the selected
/// algorithms has no `erase_all` routine, [`FlashError::UnsupportedOperation`] is
/// returned before the transport is touched.
pub fn erase_all(
    registry: &Registry,
    variant: &str,
    core: &str,
    transport: &mut dyn Transport,
    options: &DownloadOptions,
) -> Result<(), FlashError> {
    tracing::debug!("Erasing all...");

    let target = lookup_target(registry, variant)?;
    target.core(core)?;

    let algorithms = non_overlapping_algorithms(&target.algorithms_for(core));
    if algorithms.is_empty() {
        return Err(FlashError::NoAlgorithmForRange {
            core: core.to_string(),
            range: 0..0,
        });
    }

    if let Some(algorithm) = algorithms.iter().find(|a| !a.supports_erase_all()) {
        return Err(FlashError::UnsupportedOperation {
            algorithm: algorithm.name.clone(),
            operation: "erase_all",
        });
    }

    let flash_algorithms = assemble(&target, core, algorithms)?;

    for algorithm in flash_algorithms {
        tracing::debug!("Erasing with algorithm: {}", algorithm.name);
        let mut flasher = Flasher::new(&mut *transport, algorithm, options);
        flasher.run_erase_all()?;
    }

    Ok(())
}

/// Erases all sectors which intersect `range`.
///
/// The whole range has to be covered by flash algorithms of `core`. An empty range
/// does nothing.
pub fn erase_range(
    registry: &Registry,
    variant: &str,
    core: &str,
    transport: &mut dyn Transport,
    range: Range<u64>,
    options: &DownloadOptions,
) -> Result<(), FlashError> {
    tracing::debug!("Erasing range {:#010x?}", range);

    let target = lookup_target(registry, variant)?;
    target.core(core)?;

    if range.is_empty() {
        return Ok(());
    }

    let algorithms = target.algorithms_for(core);
    if algorithms.is_empty() {
        return Err(FlashError::NoAlgorithmForRange {
            core: core.to_string(),
            range,
        });
    }

    let mut phases: Vec<(Arc<RawFlashAlgorithm>, Vec<FlashSector>)> = vec![];
    let mut address = range.start;
    while address < range.end {
        let (algorithm, run_end) =
            algorithm_at(&algorithms, address).ok_or(FlashError::RangeOutOfBounds { address })?;

        let flash = &algorithm.flash_properties;
        let end = range.end.min(run_end);

        let index = match phases
            .iter()
            .position(|(existing, _)| Arc::ptr_eq(existing, algorithm))
        {
            Some(index) => index,
            None => {
                phases.push((algorithm.clone(), vec![]));
                phases.len() - 1
            }
        };
        let sectors = &mut phases[index].1;

        while address < end {
            let sector = flash
                .sector_info(address)
                .ok_or(FlashError::RangeOutOfBounds { address })?;
            sectors.push(FlashSector {
                address: sector.base_address,
                size: sector.size,
            });
            address = sector.base_address + sector.size;
        }
    }

    let raw: Vec<_> = phases.iter().map(|(algorithm, _)| algorithm.clone()).collect();
    let flash_algorithms = assemble(&target, core, raw)?;

    for (algorithm, (_, sectors)) in flash_algorithms.into_iter().zip(phases) {
        let mut flasher = Flasher::new(&mut *transport, algorithm, options);
        flasher.erase_sectors(&sectors)?;
    }

    Ok(())
}

/// Drops algorithms which overlap a preferred one.
fn non_overlapping_algorithms(
    algorithms: &[Arc<RawFlashAlgorithm>],
) -> Vec<Arc<RawFlashAlgorithm>> {
    let mut ordered: Vec<&Arc<RawFlashAlgorithm>> = algorithms.iter().collect();
    // Default algorithms first, otherwise declaration order.
    ordered.sort_by_key(|algorithm| !algorithm.default);

    let mut selected: Vec<Arc<RawFlashAlgorithm>> = vec![];
    for algorithm in ordered {
        let range = &algorithm.flash_properties.address_range;
        if selected
            .iter()
            .any(|other| other.flash_properties.address_range.intersects_range(range))
        {
            tracing::debug!("Skipping overlapping flash algorithm {}", algorithm.name);
            continue;
        }
        selected.push(algorithm.clone());
    }
    selected
}

/// Lays out all algorithms in the RAM of `core`, before any of them is used.
fn assemble(
    target: &Target,
    core: &str,
    algorithms: Vec<Arc<RawFlashAlgorithm>>,
) -> Result<Vec<FlashAlgorithm>, FlashError> {
    let architecture = target.architecture(core)?;
    let ram = target.ram_region_for(core)?;

    algorithms
        .into_iter()
        .map(|raw| FlashAlgorithm::assemble_from_raw(raw, ram, architecture))
        .collect()
}
