use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Range;
use std::sync::Arc;

use nvmflash_target::{FlashProperties, MemoryRange, RawFlashAlgorithm};

use super::FlashError;
use crate::config::{algorithm_at, Target};

/// The description of a page in flash.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashPage {
    address: u64,
    data: Vec<u8>,
}

impl Debug for FlashPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashPage")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &format_args!("{:#x}", self.size()))
            .finish()
    }
}

impl FlashPage {
    /// Returns the start address of the page.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the page in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns the data slice of the page.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(super) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The description of a sector in flash.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlashSector {
    pub(super) address: u64,
    pub(super) size: u64,
}

impl Debug for FlashSector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashSector")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl FlashSector {
    /// Returns the start address of the sector.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the sector in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A part of a page which is not covered by the data to program and
/// which has to be read back from flash before the sector is erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashFill {
    address: u64,
    size: u64,
    page_index: usize,
}

impl FlashFill {
    /// Returns the start address of the fill.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the fill in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the index of the page in the layout the fill belongs to.
    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

/// The built layout of the data in flash: the ordered erase and program operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashLayout {
    pub(super) sectors: Vec<FlashSector>,
    pub(super) pages: Vec<FlashPage>,
    pub(super) fills: Vec<FlashFill>,
}

impl FlashLayout {
    /// Get the sectors to erase, in ascending address order.
    pub fn sectors(&self) -> &[FlashSector] {
        &self.sectors
    }

    /// Get the pages to program, in ascending address order.
    pub fn pages(&self) -> &[FlashPage] {
        &self.pages
    }

    pub(super) fn pages_mut(&mut self) -> &mut [FlashPage] {
        &mut self.pages
    }

    /// Get the fills of the flash layout.
    pub fn fills(&self) -> &[FlashFill] {
        &self.fills
    }
}

/// A helper structure to build a flash layout from a set of data blocks.
#[derive(Debug, Clone, Default)]
pub struct FlashBuilder {
    /// Sorted, non-overlapping blocks of data.
    data_blocks: Vec<(u64, Vec<u8>)>,
}

impl FlashBuilder {
    /// Creates a new `FlashBuilder` with empty data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block of data to be programmed.
    ///
    /// Empty blocks are ignored. Programming does not start until the data is committed.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }

        let end = address
            .checked_add(data.len() as u64)
            .ok_or(FlashError::RangeOutOfBounds { address })?;
        let range = address..end;
        let position = match self
            .data_blocks
            .binary_search_by_key(&address, |(block_address, _)| *block_address)
        {
            Ok(_) => return Err(FlashError::DataOverlap(address)),
            Err(position) => position,
        };

        // Only the neighbours can intersect, the list is sorted.
        let neighbours = position
            .checked_sub(1)
            .into_iter()
            .chain(std::iter::once(position));
        for index in neighbours {
            if let Some((block_address, block)) = self.data_blocks.get(index) {
                let block_range = *block_address..block_address + block.len() as u64;
                if block_range.intersects_range(&range) {
                    return Err(FlashError::DataOverlap(address));
                }
            }
        }

        self.data_blocks.insert(position, (address, data.to_vec()));
        Ok(())
    }

    /// Returns true if no data was added.
    pub fn is_empty(&self) -> bool {
        self.data_blocks.is_empty()
    }

    /// Iterates over the added blocks in ascending address order.
    pub fn data_blocks(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.data_blocks
            .iter()
            .map(|(address, data)| (*address, data.as_slice()))
    }

    /// Layouts the data into erase and program operations for one flash.
    ///
    /// Every distinct sector touched by the data is erased once, every page-aligned chunk
    /// of data becomes one program operation. Page bytes not covered by data are set to the
    /// erased byte value.
    ///
    /// If `restore_unwritten_bytes` is `true`, all pages of the touched sectors are
    /// programmed, and the bytes not covered by data are recorded as [`FlashFill`]s, which
    /// have to be read from the flash before erasing.
    pub fn build_sectors_and_pages(
        &self,
        flash: &FlashProperties,
        restore_unwritten_bytes: bool,
    ) -> Result<FlashLayout, FlashError> {
        let mut sectors: Vec<FlashSector> = Vec::new();
        // Page address -> (page, ranges written by data)
        let mut pages: BTreeMap<u64, (FlashPage, Vec<Range<u64>>)> = BTreeMap::new();

        for (block_address, block) in self.data_blocks() {
            let block_end = block_address + block.len() as u64;
            let mut address = block_address;

            while address < block_end {
                let page_info = flash
                    .page_info(address)
                    .ok_or(FlashError::RangeOutOfBounds { address })?;
                let page_range = page_info.address_range();

                let (page, written) = pages.entry(page_info.base_address).or_insert_with(|| {
                    tracing::trace!("Added page {:#010x?}", page_range);
                    (new_page(flash, page_info.base_address, page_info.size), vec![])
                });

                let end = block_end.min(page_range.end);
                let page_offset = (address - page.address) as usize;
                let block_offset = (address - block_address) as usize;
                let size = (end - address) as usize;

                page.data[page_offset..page_offset + size]
                    .copy_from_slice(&block[block_offset..block_offset + size]);
                written.push(address..end);

                address = end;
            }
        }

        // Every sector overlapping a page has to be erased.
        for page_address in pages.keys() {
            let page_end = page_address + flash.page_size as u64;
            let mut address = *page_address;
            while address < page_end && address < flash.address_range.end {
                let sector = flash
                    .sector_info(address)
                    .ok_or(FlashError::RangeOutOfBounds { address })?;
                if sectors.last().map(|s| s.address) != Some(sector.base_address) {
                    tracing::trace!("Added sector {:#010x?}", sector.address_range());
                    sectors.push(FlashSector {
                        address: sector.base_address,
                        size: sector.size,
                    });
                }
                address = sector.base_address + sector.size;
            }
        }

        if restore_unwritten_bytes {
            for sector in &sectors {
                let sector_end = sector.address + sector.size;
                let mut address = sector.address;
                while address < sector_end {
                    let Some(page_info) = flash.page_info(address) else {
                        break;
                    };
                    pages.entry(page_info.base_address).or_insert_with(|| {
                        (new_page(flash, page_info.base_address, page_info.size), vec![])
                    });
                    address = page_info.base_address + page_info.size as u64;
                }
            }
        }

        let mut fills = vec![];
        let pages = pages
            .into_values()
            .enumerate()
            .map(|(page_index, (page, written))| {
                if restore_unwritten_bytes {
                    let mut cursor = page.address;
                    let page_end = page.address + page.size() as u64;
                    for range in written.iter().chain(std::iter::once(&(page_end..page_end))) {
                        if range.start > cursor {
                            fills.push(FlashFill {
                                address: cursor,
                                size: range.start - cursor,
                                page_index,
                            });
                        }
                        cursor = range.end;
                    }
                }
                page
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            "Layout: {} sectors, {} pages, {} fills",
            sectors.len(),
            pages.len(),
            fills.len()
        );

        Ok(FlashLayout {
            sectors,
            pages,
            fills,
        })
    }
}

fn new_page(flash: &FlashProperties, address: u64, size: u32) -> FlashPage {
    FlashPage {
        address,
        data: vec![flash.erased_byte_value; size as usize],
    }
}

/// The data to program with one flash algorithm.
#[derive(Debug, Clone)]
pub struct FlashPhase {
    algorithm: Arc<RawFlashAlgorithm>,
    builder: FlashBuilder,
}

impl FlashPhase {
    /// The flash algorithm used for this phase.
    pub fn algorithm(&self) -> &Arc<RawFlashAlgorithm> {
        &self.algorithm
    }

    /// The data programmed in this phase.
    pub fn builder(&self) -> &FlashBuilder {
        &self.builder
    }
}

/// The data of a [`FlashBuilder`] split up by the flash algorithms responsible for it.
///
/// Each phase is loaded, initialized and uninitialized on its own, in ascending address order.
#[derive(Debug, Clone, Default)]
pub struct FlashPlan {
    phases: Vec<FlashPhase>,
}

impl FlashPlan {
    /// Assigns every byte of `builder` to a flash algorithm of `core`.
    ///
    /// Where several algorithms cover an address, the default one is used, otherwise
    /// the one declared first.
    pub fn new(target: &Target, core: &str, builder: &FlashBuilder) -> Result<Self, FlashError> {
        target.core(core)?;

        if builder.is_empty() {
            return Ok(FlashPlan::default());
        }

        let algorithms = target.algorithms_for(core);
        if algorithms.is_empty() {
            let start = builder.data_blocks().next().map_or(0, |(address, _)| address);
            let end = builder
                .data_blocks()
                .last()
                .map_or(0, |(address, data)| address + data.len() as u64);
            return Err(FlashError::NoAlgorithmForRange {
                core: core.to_string(),
                range: start..end,
            });
        }

        let mut phases: Vec<FlashPhase> = vec![];
        for (block_address, block) in builder.data_blocks() {
            let block_end = block_address + block.len() as u64;
            let mut address = block_address;

            while address < block_end {
                let (algorithm, run_end) = algorithm_at(&algorithms, address)
                    .ok_or(FlashError::RangeOutOfBounds { address })?;

                let end = block_end.min(run_end);
                let chunk = &block[(address - block_address) as usize..(end - block_address) as usize];

                match phases
                    .iter_mut()
                    .find(|phase| Arc::ptr_eq(&phase.algorithm, algorithm))
                {
                    Some(phase) => phase.builder.add_data(address, chunk)?,
                    None => {
                        let mut phase = FlashPhase {
                            algorithm: algorithm.clone(),
                            builder: FlashBuilder::new(),
                        };
                        phase.builder.add_data(address, chunk)?;
                        phases.push(phase);
                    }
                }

                address = end;
            }
        }

        Ok(FlashPlan { phases })
    }

    /// Returns true if there is nothing to program.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// The phases of the plan, in the order they are executed.
    pub fn phases(&self) -> &[FlashPhase] {
        &self.phases
    }
}
