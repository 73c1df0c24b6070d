//! Flash programming operations.
//!
//! This modules provides a means to do flash erasing and programming through a
//! flash algorithm which is loaded into the RAM of the target.
//!
//! It provides a convenient high level interface that can flash a HEX or BIN file
//! as well as a lower level block based interface.
//!
//! ## Examples
//!
//! ### Programming a block of data
//!
//! ```no_run
//! use nvmflash::config::Registry;
//! use nvmflash::flashing::{self, DownloadOptions};
//! # use nvmflash::transport::Transport;
//! # fn transport() -> Box<dyn Transport> { unimplemented!() }
//!
//! let mut registry = Registry::new();
//! registry.add_target_family_from_yaml(std::fs::File::open("nrf52.yaml")?)?;
//!
//! let mut transport = transport();
//! flashing::erase_and_program(
//!     &registry,
//!     "nRF52832_xxAA",
//!     "main",
//!     transport.as_mut(),
//!     0x0,
//!     &[0x1, 0x2, 0x3],
//!     &DownloadOptions::default(),
//! )?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ### Adding data manually
//!
//! ```no_run
//! use nvmflash::config::Registry;
//! use nvmflash::flashing::DownloadOptions;
//! # use nvmflash::transport::Transport;
//! # fn transport() -> Box<dyn Transport> { unimplemented!() }
//!
//! # let registry = Registry::new();
//! let target = registry.get_target_by_name("nRF52832_xxAA")?;
//! let mut loader = target.flash_loader();
//!
//! loader.add_data(0x1000, &[0x1, 0x2, 0x3])?;
//!
//! // Finally, the data can be programmed:
//! let mut transport = transport();
//! loader.commit(&target, "main", transport.as_mut(), &DownloadOptions::default())?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod builder;
mod download;
mod erase;
mod error;
mod flash_algorithm;
mod flasher;
mod loader;
mod progress;
mod routine;

pub use builder::{
    FlashBuilder, FlashFill, FlashLayout, FlashPage, FlashPhase, FlashPlan, FlashSector,
};
pub use download::*;
pub use erase::*;
pub use error::*;
pub use flash_algorithm::*;
pub use flasher::Flasher;
pub use loader::*;
pub use progress::*;
pub use routine::{FlasherState, Routine};
