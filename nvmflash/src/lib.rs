//! # Flash programming engine for embedded targets
//!
//! `nvmflash` programs the non-volatile memory of microcontrollers through a
//! debug connection. It does not know how to write flash by itself. Instead it
//! loads a small *flash algorithm* from the target description into the RAM
//! of the target and calls its routines to erase and program the flash.
//!
//! The crate is built around three parts:
//!
//! - [`config`]: the catalogue of target descriptions, see [`config::Registry`].
//! - [`transport`]: what the engine needs from the debug connection, see [`transport::Transport`].
//! - [`flashing`]: planning and running the flash operations, see [`flashing::erase_and_program`].
//!
//! With the `test` feature, [`transport::fake::FakeTransport`] simulates a core
//! with flash, so the engine can be exercised without hardware.

pub mod config;
#[warn(missing_docs)]
pub mod flashing;
#[warn(missing_docs)]
pub mod transport;

pub use config::{Registry, Target};
pub use flashing::{DownloadOptions, FlashError};
pub use transport::{Transport, TransportError};
