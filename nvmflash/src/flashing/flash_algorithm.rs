use std::sync::Arc;

use nvmflash_target::{Architecture, FlashProperties, RamRegion, RawFlashAlgorithm};

use super::FlashError;

/// A flash algorithm, which has been assembled for a specific
/// RAM region of a chip.
///
/// To create a [FlashAlgorithm], call the [`assemble_from_raw`] function.
///
/// The RAM layout, starting at `load_address`, is:
///
/// - the return trap header for the architecture
/// - the instruction blob, padded to a word
/// - one or two page buffers
/// - the stack
///
/// [`assemble_from_raw`]: FlashAlgorithm::assemble_from_raw
#[derive(Debug, Clone)]
pub struct FlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description this algorithm was assembled from.
    pub raw: Arc<RawFlashAlgorithm>,
    /// Memory address where the image is loaded to. Routines return to this address.
    pub load_address: u64,
    /// Address of the first instruction of the blob. Entry point offsets are relative to it.
    pub code_start: u64,
    /// Header and instructions, exactly as they are written to RAM.
    pub image: Vec<u8>,
    /// Address of the `Init()` entry point.
    pub pc_init: u64,
    /// Address of the `UnInit()` entry point.
    pub pc_uninit: u64,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point. Optional.
    pub pc_erase_all: Option<u64>,
    /// Value of the static base register, which determines where the
    /// position-independent data of the algorithm resides.
    pub static_base: u64,
    /// Initial value of the stack pointer when calling any flash algo API.
    pub begin_stack: u64,
    /// Base addresses of the page buffers. If at least two buffers are present,
    /// double buffered programming is possible.
    pub page_buffers: Vec<u64>,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl FlashAlgorithm {
    const FLASH_ALGO_MIN_STACK_SIZE: u32 = 512;

    // Two `ebreak` instructions
    const RISCV_FLASH_BLOB_HEADER: [u32; 2] = [0x0010_0073, 0x0010_0073];

    const ARM_FLASH_BLOB_HEADER: [u32; 8] = [
        0xE00A_BE00,
        0x062D_780D,
        0x2408_4068,
        0xD300_0040,
        0x1E64_4058,
        0x1C49_D1FA,
        0x2A00_1E52,
        0x0477_0D1F,
    ];

    fn algorithm_header(architecture: Architecture) -> &'static [u32] {
        match architecture {
            Architecture::Arm => &Self::ARM_FLASH_BLOB_HEADER,
            Architecture::Riscv => &Self::RISCV_FLASH_BLOB_HEADER,
        }
    }

    /// Size of the return trap header placed in front of the instructions.
    pub fn header_size(architecture: Architecture) -> u64 {
        std::mem::size_of_val(Self::algorithm_header(architecture)) as u64
    }

    /// Constructs a complete flash algorithm, laid out in the given RAM region.
    ///
    /// This is a pure computation, nothing is written to the target.
    pub fn assemble_from_raw(
        raw: Arc<RawFlashAlgorithm>,
        ram_region: &RamRegion,
        architecture: Architecture,
    ) -> Result<Self, FlashError> {
        let page_size = raw.flash_properties.page_size;
        if page_size == 0 || page_size % 4 != 0 {
            return Err(FlashError::InvalidPageSize { size: page_size });
        }

        let header = Self::algorithm_header(architecture);
        let mut image: Vec<u8> = header.iter().flat_map(|word| word.to_le_bytes()).collect();
        image.extend_from_slice(&raw.instructions);
        // Pad the blob to a whole word.
        image.resize(align_up(image.len() as u64, 4) as usize, 0);

        let header_size = Self::header_size(architecture);
        let load_address = ram_region.range.start;
        let code_start = load_address + header_size;
        let code_end = load_address + image.len() as u64;

        let available = ram_region.size();

        // The data section offset is part of the algorithm's own layout and is used as is.
        let static_base = code_start
            .checked_add(raw.data_section_offset)
            .filter(|base| *base < ram_region.range.end)
            .ok_or_else(|| FlashError::InsufficientRam {
                name: raw.name.clone(),
                required: header_size.saturating_add(raw.data_section_offset),
                available,
            })?;

        let buffer_start = align_up(code_end.max(static_base), 4);
        let buffer_size = page_size as u64;
        let stack_size = raw.stack_size.unwrap_or(Self::FLASH_ALGO_MIN_STACK_SIZE) as u64;

        let fixed = buffer_start - load_address + stack_size;
        let required = fixed + buffer_size;

        if required > available {
            return Err(FlashError::InsufficientRam {
                name: raw.name.clone(),
                required,
                available,
            });
        }

        let page_buffers = if fixed + 2 * buffer_size <= available {
            vec![buffer_start, buffer_start + buffer_size]
        } else {
            vec![buffer_start]
        };
        let buffers_end = buffer_start + page_buffers.len() as u64 * buffer_size;

        // The stack grows down from the top of its area, which has to be 8 byte aligned.
        let begin_stack = (buffers_end + stack_size) & !0x7;

        tracing::debug!(
            "Flash algorithm {}: load address {:#010x}, static base {:#010x}, stack top {:#010x}",
            raw.name,
            load_address,
            static_base,
            begin_stack
        );
        tracing::debug!("Page buffers: {:#010x?}", page_buffers);

        let entry = |offset: u64| {
            code_start
                .checked_add(offset)
                .ok_or(FlashError::RegisterValueNotSupported(offset))
        };

        Ok(FlashAlgorithm {
            name: raw.name.clone(),
            load_address,
            code_start,
            image,
            pc_init: entry(raw.pc_init)?,
            pc_uninit: entry(raw.pc_uninit)?,
            pc_program_page: entry(raw.pc_program_page)?,
            pc_erase_sector: entry(raw.pc_erase_sector)?,
            pc_erase_all: raw.pc_erase_all.map(entry).transpose()?,
            static_base,
            begin_stack,
            page_buffers,
            flash_properties: raw.flash_properties.clone(),
            raw,
        })
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
