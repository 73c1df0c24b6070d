//! The routines of a flash algorithm and the state transitions they drive.
//!
//! Every call into the algorithm goes through the same path in the flasher:
//! check the required state, enter the busy state, call, wait, check the
//! return code and settle. The per-routine differences live in [`Routine::transition`].

use std::time::Duration;

use super::{DownloadOptions, FlashAlgorithm, FlashError};

/// One of the five entry points of a flash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, docsplay::Display)]
pub enum Routine {
    /// init
    Init,
    /// erase_sector
    EraseSector,
    /// erase_all
    EraseAll,
    /// program_page
    ProgramPage,
    /// uninit
    Uninit,
}

/// The state of a [`Flasher`](super::Flasher) and the algorithm it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlasherState {
    /// The algorithm is not in target RAM.
    Unloaded,
    /// The algorithm is in target RAM but was never initialized.
    Loaded,
    /// The init routine is running.
    Initializing,
    /// The algorithm is initialized and idle.
    Initialized,
    /// An erase routine is running.
    Erasing,
    /// The program routine is running.
    Programming,
    /// The uninit routine is running.
    Uninitializing,
    /// The algorithm was uninitialized cleanly. It stays resident and can be initialized again.
    Uninitialized,
    /// A routine failed or timed out.
    Faulted,
}

impl FlasherState {
    /// Returns true if the algorithm image is present in target RAM.
    pub fn is_resident(&self) -> bool {
        !matches!(self, FlasherState::Unloaded | FlasherState::Faulted)
    }

    /// Returns true if an uninit call has to be attempted before the session ends.
    pub(crate) fn needs_uninit(&self) -> bool {
        matches!(self, FlasherState::Initialized | FlasherState::Faulted)
    }
}

/// The row of the transition table for one routine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition {
    /// States the routine may be started from.
    pub from: &'static [FlasherState],
    /// State while the routine runs.
    pub busy: FlasherState,
    /// State after the routine returned zero.
    pub to: FlasherState,
}

impl Routine {
    pub(crate) fn transition(self) -> Transition {
        use FlasherState as S;

        match self {
            Routine::Init => Transition {
                from: &[S::Loaded, S::Uninitialized],
                busy: S::Initializing,
                to: S::Initialized,
            },
            Routine::EraseSector | Routine::EraseAll => Transition {
                from: &[S::Initialized],
                busy: S::Erasing,
                to: S::Initialized,
            },
            Routine::ProgramPage => Transition {
                from: &[S::Initialized],
                busy: S::Programming,
                to: S::Initialized,
            },
            Routine::Uninit => Transition {
                from: &[S::Initialized, S::Faulted],
                busy: S::Uninitializing,
                to: S::Uninitialized,
            },
        }
    }

    /// Builds the error for a non-zero return code of this routine.
    pub(crate) fn failure(self, code: u32, address: Option<u64>) -> FlashError {
        match self {
            Routine::Init => FlashError::InitFailed(code),
            Routine::EraseSector | Routine::EraseAll => FlashError::EraseFailed {
                code,
                sector: address,
            },
            Routine::ProgramPage => FlashError::ProgramFailed {
                code,
                address: address.unwrap_or_default(),
            },
            Routine::Uninit => FlashError::UninitFailed(code),
        }
    }

    /// How long the routine may run before the call is considered hung.
    pub(crate) fn timeout(self, algorithm: &FlashAlgorithm, options: &DownloadOptions) -> Duration {
        let props = &algorithm.flash_properties;
        match self {
            Routine::Init | Routine::Uninit => Duration::from_millis(options.init_timeout_ms),
            Routine::EraseSector => Duration::from_millis(props.erase_sector_timeout as u64),
            Routine::EraseAll => options.erase_all_timeout.resolve(props),
            Routine::ProgramPage => Duration::from_millis(props.program_page_timeout as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Routine::Init, FlasherState::Loaded, true)]
    #[test_case(Routine::Init, FlasherState::Uninitialized, true)]
    #[test_case(Routine::Init, FlasherState::Initialized, false)]
    #[test_case(Routine::Init, FlasherState::Faulted, false)]
    #[test_case(Routine::EraseSector, FlasherState::Initialized, true)]
    #[test_case(Routine::EraseSector, FlasherState::Loaded, false)]
    #[test_case(Routine::ProgramPage, FlasherState::Erasing, false)]
    #[test_case(Routine::Uninit, FlasherState::Faulted, true)]
    #[test_case(Routine::Uninit, FlasherState::Loaded, false)]
    fn allowed_start_states(routine: Routine, state: FlasherState, allowed: bool) {
        assert_eq!(routine.transition().from.contains(&state), allowed);
    }

    #[test]
    fn failure_keeps_code_verbatim() {
        assert!(matches!(
            Routine::Init.failure(0xdead, None),
            FlashError::InitFailed(0xdead)
        ));
        assert!(matches!(
            Routine::ProgramPage.failure(7, Some(0x200)),
            FlashError::ProgramFailed {
                code: 7,
                address: 0x200
            }
        ));
        assert!(matches!(
            Routine::EraseAll.failure(3, None),
            FlashError::EraseFailed {
                code: 3,
                sector: None
            }
        ));
    }

    #[test]
    fn routine_names() {
        assert_eq!(Routine::ProgramPage.to_string(), "program_page");
        assert_eq!(Routine::EraseAll.to_string(), "erase_all");
    }
}
