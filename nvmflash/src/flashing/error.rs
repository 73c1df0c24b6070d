use std::ops::Range;

use crate::transport::TransportError;

use super::{FlasherState, Routine};

/// Describes any error that happened during the or in preparation for the flashing procedure.
///
/// Errors which are detected while planning (descriptor lookups, address checks,
/// RAM layout) are always returned before the transport is touched.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FlashError {
    /// No target variant named `{0}` is known.
    UnknownVariant(String),

    /// Target `{target}` has no core named `{core}`.
    UnknownCore { target: String, core: String },

    /// No flash algorithm for core `{core}` covers the address range {range:#010x?}.
    NoAlgorithmForRange { core: String, range: Range<u64> },

    /// The data at {address:#010x} is not contained in the address range of any flash algorithm.
    RangeOutOfBounds { address: u64 },

    /// No RAM usable by core `{core}` is defined for target `{target}`.
    NoRamDefined { target: String, core: String },

    /// The flash algorithm `{name}` needs {required} bytes of RAM, but only {available} bytes are available.
    InsufficientRam {
        name: String,
        required: u64,
        available: u64,
    },

    /// The page size {size:#x} of the flash algorithm is not a non-zero multiple of 4.
    InvalidPageSize { size: u32 },

    /// The data added at {0:#010x} overlaps with data which was added before.
    DataOverlap(u64),

    /// The init routine of the flash algorithm failed with code {0}.
    InitFailed(u32),

    /// The erase routine of the flash algorithm failed with code {code} (sector: {sector:#010x?}).
    EraseFailed { code: u32, sector: Option<u64> },

    /// Programming the page at {address:#010x} failed with code {code}.
    ProgramFailed { code: u32, address: u64 },

    /// The uninit routine of the flash algorithm failed with code {0}.
    UninitFailed(u32),

    /// The {0} routine of the flash algorithm did not return in time.
    OperationTimeout(Routine),

    /// The core locked up while running the {0} routine.
    CoreLockedUp(Routine),

    /// The flash algorithm `{algorithm}` does not support {operation}.
    UnsupportedOperation {
        algorithm: String,
        operation: &'static str,
    },

    /// The RAM contents did not match the expected contents after loading the flash algorithm.
    FlashAlgorithmNotLoaded,

    /// The {routine} routine cannot be called while the flasher is in state {state:?}.
    InvalidState {
        routine: Routine,
        state: FlasherState,
    },

    /// The flash contents at {address:#010x} do not match the programmed data.
    Verify { address: u64 },

    /// The operation was aborted.
    Aborted,

    /// The debug transport reported an error.
    Transport(#[from] TransportError),

    /// The value {0:#x} does not fit into a 32 bit register.
    RegisterValueNotSupported(u64),
}
