//! Register assignment used when calling into a flash algorithm.
//!
//! Flash algorithms are plain functions. The engine passes up to four
//! arguments in the architecture's argument registers, points the return
//! address at the trap in the algorithm header, and reads the result from
//! the first result register once the core halts again.

use nvmflash_target::Architecture;

/// Identifies a core register towards the [`Transport`](super::Transport).
///
/// ARM registers use their number (`r0` is 0, `pc` is 15). RISC-V general
/// purpose registers are `0x1000 + n`, CSRs use their CSR number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub u16);

impl std::fmt::Display for RegisterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The registers the engine touches to call a routine on a given architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingConvention {
    /// Program counter.
    pub program_counter: RegisterId,
    /// Stack pointer, set on init only.
    pub stack_pointer: RegisterId,
    /// Return address, pointing at the trap in the algorithm header.
    pub return_address: RegisterId,
    /// Base register of the algorithm's static data, set on init only.
    pub static_base: RegisterId,
    /// Argument registers, in order.
    pub arguments: [RegisterId; 4],
    /// The register holding the return code.
    pub result: RegisterId,
}

impl CallingConvention {
    /// AAPCS: arguments in `r0`-`r3`, static base in `r9`.
    pub const ARM: CallingConvention = CallingConvention {
        program_counter: RegisterId(15),
        stack_pointer: RegisterId(13),
        return_address: RegisterId(14),
        static_base: RegisterId(9),
        arguments: [RegisterId(0), RegisterId(1), RegisterId(2), RegisterId(3)],
        result: RegisterId(0),
    };

    /// RISC-V ILP32: arguments in `a0`-`a3`, static base in `s1`, `pc` is `dpc`.
    pub const RISCV: CallingConvention = CallingConvention {
        program_counter: RegisterId(0x7b1),
        stack_pointer: RegisterId(0x1002),
        return_address: RegisterId(0x1001),
        static_base: RegisterId(0x1009),
        arguments: [
            RegisterId(0x100a),
            RegisterId(0x100b),
            RegisterId(0x100c),
            RegisterId(0x100d),
        ],
        result: RegisterId(0x100a),
    };

    /// Returns the calling convention of the given architecture.
    pub fn for_architecture(architecture: Architecture) -> &'static CallingConvention {
        match architecture {
            Architecture::Arm => &Self::ARM,
            Architecture::Riscv => &Self::RISCV,
        }
    }

    /// Returns the argument register with the given index.
    pub fn argument_register(&self, index: usize) -> RegisterId {
        self.arguments[index]
    }
}
