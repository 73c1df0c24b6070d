use super::flash_properties::FlashProperties;
use crate::serialize::{hex_option, hex_u_int};
use base64::{engine::general_purpose as b64, Engine as _};
use serde::{Deserialize, Serialize};

/// The raw flash algorithm is the description of a flash algorithm,
/// and is usually read from a target description file.
///
/// Before it can be used for flashing, it has to be assembled for
/// a specific RAM region. This determines the RAM addresses which are
/// used when flashing.
///
/// The instruction blob is opaque: it is never parsed, only copied
/// into target RAM together with the entry point offsets below.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    #[serde(default)]
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// Position-independent code of the algorithm, base64 encoded in YAML.
    #[serde(deserialize_with = "deserialize")]
    #[serde(serialize_with = "serialize")]
    pub instructions: Vec<u8>,
    /// Offset of the `Init()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_init: u64,
    /// Offset of the `UnInit()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_uninit: u64,
    /// Offset of the `ProgramPage()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_program_page: u64,
    /// Offset of the `EraseSector()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_erase_sector: u64,
    /// Offset of the `EraseAll()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_erase_all: Option<u64>,
    /// The offset from the load base to the data section of the algorithm.
    #[serde(serialize_with = "hex_u_int")]
    pub data_section_offset: u64,
    /// The stack size the algorithm needs, in bytes.
    #[serde(default)]
    pub stack_size: Option<u32>,
    /// The cores which can run this algorithm. Empty means all cores of the chip.
    #[serde(default)]
    pub cores: Vec<String>,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl RawFlashAlgorithm {
    /// Returns whether the algorithm can run on the core with the given name.
    pub fn runs_on(&self, core_name: &str) -> bool {
        self.cores.is_empty() || self.cores.iter().any(|c| c == core_name)
    }

    /// Returns whether the algorithm implements a whole-chip erase.
    pub fn supports_erase_all(&self) -> bool {
        self.pc_erase_all.is_some()
    }
}

fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&b64::STANDARD.encode(bytes))
}

fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Base64Visitor;

    impl<'de> serde::de::Visitor<'de> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "base64 ASCII text")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            // Long blobs are often folded over several lines.
            let compact: String = v.split_whitespace().collect();
            b64::STANDARD
                .decode(compact)
                .map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_str(Base64Visitor)
}

#[cfg(test)]
mod test {
    use super::*;

    const ALGORITHM: &str = r#"
name: test_algo
description: A test algorithm
default: true
instructions: ABEiMwBERVU=
pc_init: 0x1
pc_uninit: 0x5
pc_program_page: 0x9
pc_erase_sector: 0xd
pc_erase_all: null
data_section_offset: 0x20
flash_properties:
  address_range:
    start: 0x0
    end: 0x10000
  page_size: 0x200
  erased_byte_value: 0xff
  program_page_timeout: 100
  erase_sector_timeout: 1000
  sectors:
    - size: 0x2000
      address: 0x0
"#;

    #[test]
    fn deserialize_base64_instructions() {
        let algo: RawFlashAlgorithm = serde_yaml::from_str(ALGORITHM).unwrap();

        assert_eq!(algo.instructions, [0x00, 0x11, 0x22, 0x33, 0x00, 0x44, 0x45, 0x55]);
        assert_eq!(algo.pc_erase_all, None);
        assert!(!algo.supports_erase_all());
        assert_eq!(algo.data_section_offset, 0x20);
        assert_eq!(algo.flash_properties.page_size, 0x200);
        assert!(algo.runs_on("any-core"));
    }

    #[test]
    fn reject_invalid_base64() {
        let yaml = ALGORITHM.replace("ABEiMwBERVU=", "not base64!");
        assert!(serde_yaml::from_str::<RawFlashAlgorithm>(&yaml).is_err());
    }
}
