use crate::memory::{PageInfo, SectorDescription, SectorInfo};
use crate::serialize::{hex_range, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Properties of flash memory, which
/// are used when programming Flash memory.
///
/// These values are read from the
/// YAML target description files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlashProperties {
    /// The range of the device flash.
    #[serde(serialize_with = "hex_range")]
    pub address_range: Range<u64>,
    /// The page size of the device flash.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// The value of a byte in flash that was just erased.
    #[serde(serialize_with = "hex_u_int")]
    pub erased_byte_value: u8,
    /// The approximative time it takes to program a page, in milliseconds.
    pub program_page_timeout: u32,
    /// The approximative time it takes to erase a sector, in milliseconds.
    pub erase_sector_timeout: u32,
    /// The available sectors of the device flash.
    #[serde(default)]
    pub sectors: Vec<SectorDescription>,
}

impl Default for FlashProperties {
    #[allow(clippy::reversed_empty_ranges)]
    fn default() -> Self {
        FlashProperties {
            address_range: 0..0,
            page_size: 0,
            erased_byte_value: 0,
            program_page_timeout: 0,
            erase_sector_timeout: 0,
            sectors: vec![],
        }
    }
}

impl FlashProperties {
    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        if !self.address_range.contains(&address) {
            return None;
        }

        let offset_address = address - self.address_range.start;

        // The sector table is sorted by address, so the containing group is
        // the last one starting at or before the offset.
        let group_index = self
            .sectors
            .partition_point(|s| s.address <= offset_address)
            .checked_sub(1)?;
        let containing_sector = &self.sectors[group_index];

        if containing_sector.size == 0 {
            return None;
        }

        let sector_index = (offset_address - containing_sector.address) / containing_sector.size;

        let sector_address = self.address_range.start
            + containing_sector.address
            + sector_index * containing_sector.size;

        Some(SectorInfo {
            base_address: sector_address,
            size: containing_sector.size,
        })
    }

    /// Returns the necessary information about the page which `address` resides in
    /// if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        if !self.address_range.contains(&address) || self.page_size == 0 {
            return None;
        }

        let offset = address - self.address_range.start;

        Some(PageInfo {
            base_address: address - (offset % self.page_size as u64),
            size: self.page_size,
        })
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let mut addr = self.address_range.start;
        let mut desc_idx = 0;
        std::iter::from_fn(move || {
            if addr >= self.address_range.end {
                return None;
            }

            // Advance desc_idx if needed
            if let Some(next_desc) = self.sectors.get(desc_idx + 1) {
                if self.address_range.start + next_desc.address <= addr {
                    desc_idx += 1;
                }
            }

            let size = self.sectors.get(desc_idx)?.size;
            if size == 0 {
                return None;
            }

            let sector = SectorInfo {
                base_address: addr,
                size,
            };
            addr += size;

            Some(sector)
        })
    }

    /// Checks that the sector table starts at the beginning of the flash
    /// and is strictly ascending.
    pub(crate) fn validate_sectors(&self) -> Result<(), String> {
        let Some(first) = self.sectors.first() else {
            return Err("no sectors are described".to_string());
        };
        if first.address != 0 {
            return Err(format!(
                "the first sector starts at offset {:#x} instead of 0",
                first.address
            ));
        }
        if self.sectors.iter().any(|s| s.size == 0) {
            return Err("a sector has a size of 0".to_string());
        }
        if self
            .sectors
            .windows(2)
            .any(|pair| pair[0].address >= pair[1].address)
        {
            return Err("sector descriptions are not sorted by address".to_string());
        }
        Ok(())
    }
}
