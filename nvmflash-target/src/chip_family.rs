use crate::{CoreAccessOptions, MemoryRange, MemoryRegion};

use super::chip::Chip;
use super::flash_algorithm::RawFlashAlgorithm;

use serde::{Deserialize, Serialize};

/// Source of a target description.
///
/// This is used for diagnostics, when
/// an error related to a target description occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// The target description was compiled into the application.
    BuiltIn,
    /// The target description was from an external source
    /// during runtime.
    External,
}

/// Type of a supported core.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// ARMv6-M: Cortex M0, M0+, M1
    Armv6m,
    /// ARMv7-M: Cortex M3
    Armv7m,
    /// ARMv7e-M: Cortex M4, M7
    Armv7em,
    /// ARMv8-M: Cortex M23, M33
    Armv8m,
    /// RISC-V
    Riscv,
}

impl CoreType {
    /// Returns the parent architecture family of this core type.
    pub fn architecture(&self) -> Architecture {
        match self {
            CoreType::Riscv => Architecture::Riscv,
            _ => Architecture::Arm,
        }
    }
}

/// The architecture family of a specific [`CoreType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// An ARM Cortex-M core.
    Arm,
    /// A RISC-V core.
    Riscv,
}

/// Instruction set used by a core
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionSet {
    /// ARM Thumb 2 instruction set
    Thumb2,
    /// RISC-V 32-bit instruction set
    RV32,
}

/// This describes a chip family with all its variants.
///
/// This struct is usually read from a target description
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipFamily {
    /// This is the name of the chip family in base form.
    /// E.g. `nRF52832`.
    pub name: String,
    /// This vector holds all the variants of the family.
    pub variants: Vec<Chip>,
    /// This vector holds all available algorithms.
    #[serde(default)]
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    #[serde(skip, default = "default_source")]
    /// Source of the target description, used for diagnostics
    pub source: TargetDescriptionSource,
}

fn default_source() -> TargetDescriptionSource {
    TargetDescriptionSource::External
}

impl ChipFamily {
    /// Validates the [`ChipFamily`] such that the flashing engine can make assumptions about
    /// the correctness without validating thereafter.
    ///
    /// This method should be called right after the [`ChipFamily`] is created!
    pub fn validate(&self) -> Result<(), String> {
        self.reject_duplicate_target_names()?;
        self.ensure_algorithms_exists()?;
        self.ensure_at_least_one_core()?;
        self.reject_incorrect_core_access_options()?;
        self.validate_memory_regions()?;
        self.reject_overlapping_memory_regions()?;
        self.ensure_single_boot_memory()?;
        self.validate_algorithms()?;

        Ok(())
    }

    /// Rejects target descriptions with duplicate target names. Only one of these targets can
    /// be selected, so having multiple is probably a mistake.
    fn reject_duplicate_target_names(&self) -> Result<(), String> {
        use std::collections::HashSet;

        let mut seen = HashSet::new();

        for chip in &self.variants {
            if !seen.insert(chip.name.to_ascii_lowercase()) {
                return Err(format!(
                    "Target {} appears multiple times in {}",
                    chip.name, self.name,
                ));
            }
        }

        Ok(())
    }

    /// Make sure the algorithms used on the variant actually exist on the family (this is basically a check for typos).
    fn ensure_algorithms_exists(&self) -> Result<(), String> {
        for variant in &self.variants {
            for algorithm_name in variant.flash_algorithms.iter() {
                if self.get_algorithm(algorithm_name).is_none() {
                    return Err(format!(
                        "unknown flash algorithm `{}` for variant `{}`",
                        algorithm_name, variant.name
                    ));
                }
            }
        }

        Ok(())
    }

    fn ensure_at_least_one_core(&self) -> Result<(), String> {
        for variant in &self.variants {
            let Some(core) = variant.cores.first() else {
                return Err(format!(
                    "variant `{}` does not contain any cores",
                    variant.name
                ));
            };

            let architecture = core.core_type.architecture();
            if variant
                .cores
                .iter()
                .any(|core| core.core_type.architecture() != architecture)
            {
                return Err(format!(
                    "variant `{}` contains mixed core architectures",
                    variant.name
                ));
            }
        }

        Ok(())
    }

    fn reject_incorrect_core_access_options(&self) -> Result<(), String> {
        for variant in &self.variants {
            for core in variant.cores.iter() {
                match &core.core_access_options {
                    CoreAccessOptions::Arm(_) if core.core_type.architecture() != Architecture::Arm => {
                        return Err(format!(
                            "Arm options don't match core type {:?} on core {}",
                            core.core_type, core.name
                        ));
                    }
                    CoreAccessOptions::Riscv(_)
                        if core.core_type.architecture() != Architecture::Riscv =>
                    {
                        return Err(format!(
                            "Riscv options don't match core type {:?} on core {}",
                            core.core_type, core.name
                        ));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Ensures that the memory is assigned to a core, and that all the cores exist
    fn validate_memory_regions(&self) -> Result<(), String> {
        for variant in &self.variants {
            for memory in &variant.memory_map {
                if memory.cores().is_empty() {
                    return Err(format!(
                        "Variant {}, memory region {:#010x?} is not assigned to a core",
                        variant.name,
                        memory.address_range()
                    ));
                }

                for core in memory.cores() {
                    if variant.core(core).is_none() {
                        return Err(format!(
                            "Variant {}, memory region {:#010x?} is assigned to a non-existent core {}",
                            variant.name,
                            memory.address_range(),
                            core
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn reject_overlapping_memory_regions(&self) -> Result<(), String> {
        for variant in &self.variants {
            for (index, region) in variant.memory_map.iter().enumerate() {
                let range = region.address_range();
                if let Some(other) = variant.memory_map[index + 1..]
                    .iter()
                    .find(|other| other.address_range().intersects_range(&range))
                {
                    return Err(format!(
                        "Variant {}, memory regions {:#010x?} and {:#010x?} overlap",
                        variant.name,
                        range,
                        other.address_range()
                    ));
                }
            }
        }

        Ok(())
    }

    /// Every core which can reach non-volatile memory must boot from exactly one NVM region.
    fn ensure_single_boot_memory(&self) -> Result<(), String> {
        for variant in &self.variants {
            for core in &variant.cores {
                let nvm = variant
                    .memory_map
                    .iter()
                    .filter_map(MemoryRegion::as_nvm_region)
                    .filter(|region| region.accessible_by(&core.name))
                    .collect::<Vec<_>>();

                if nvm.is_empty() {
                    continue;
                }

                let boot_regions = nvm.iter().filter(|r| r.is_boot_memory()).count();
                if boot_regions != 1 {
                    return Err(format!(
                        "Variant {}, core {} has {} boot memory regions, expected exactly one",
                        variant.name, core.name, boot_regions
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_algorithms(&self) -> Result<(), String> {
        for algorithm in &self.flash_algorithms {
            let props = &algorithm.flash_properties;
            if props.page_size == 0 || props.page_size % 4 != 0 {
                return Err(format!(
                    "flash algorithm `{}` has an invalid page size of {:#x}",
                    algorithm.name, props.page_size
                ));
            }
            if props.address_range.is_empty() {
                return Err(format!(
                    "flash algorithm `{}` covers an empty address range",
                    algorithm.name
                ));
            }
            props
                .validate_sectors()
                .map_err(|reason| format!("flash algorithm `{}`: {reason}", algorithm.name))?;
        }

        Ok(())
    }
}

impl ChipFamily {
    /// Try to find a [RawFlashAlgorithm] with a given name.
    pub fn get_algorithm(&self, name: impl AsRef<str>) -> Option<&RawFlashAlgorithm> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|elem| elem.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FAMILY: &str = r#"
name: Demo
variants:
  - name: DEMO_A
    cores:
      - name: main
        type: armv7em
        core_access_options: !Arm
          ap: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [main]
        access:
          boot: true
      - !Ram
        range:
          start: 0x20000000
          end: 0x20004000
        cores: [main]
    flash_algorithms:
      - demo_algo
flash_algorithms:
  - name: demo_algo
    instructions: ABEiMwBERVU=
    pc_init: 0x1
    pc_uninit: 0x5
    pc_program_page: 0x9
    pc_erase_sector: 0xd
    data_section_offset: 0x8
    flash_properties:
      address_range:
        start: 0x0
        end: 0x10000
      page_size: 0x100
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 1000
      sectors:
        - size: 0x1000
          address: 0x0
"#;

    fn family() -> ChipFamily {
        serde_yaml::from_str(FAMILY).unwrap()
    }

    #[test]
    fn valid_family() {
        let family = family();
        assert_eq!(family.validate(), Ok(()));
        assert_eq!(family.source, TargetDescriptionSource::External);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut family = family();
        family.variants[0].flash_algorithms.push("typo".into());
        assert!(family.validate().unwrap_err().contains("typo"));
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut family = family();
        let mut overlapping = family.variants[0].memory_map[1].clone();
        if let MemoryRegion::Ram(ram) = &mut overlapping {
            ram.range = 0x2000_1000..0x2000_2000;
        }
        family.variants[0].memory_map.push(overlapping);
        assert!(family.validate().unwrap_err().contains("overlap"));
    }

    #[test]
    fn missing_boot_memory_is_rejected() {
        let mut family = family();
        if let MemoryRegion::Nvm(nvm) = &mut family.variants[0].memory_map[0] {
            nvm.access = None;
        }
        assert!(family.validate().unwrap_err().contains("boot memory"));
    }
}
