//! BLE sensor hub.
//!
//! Polls a fixed fleet of BLE sensor peripherals one link at a time and
//! answers UDP requests from a cache of their latest readings.
//!
//! Everything in this library is hardware-free and runs on the host:
//!
//! - [`ble`] - roster, connection orchestrator and the handler seams.
//! - [`poller`] - read-once-then-close polling policy.
//! - [`cache`] - lock-free latest-value store.
//! - [`responder`] - request codec and the bounded serving window.
//!
//! Usage: `cargo test` on the host. The embedded binary (`src/main.rs`,
//! `--features embedded`) wires these modules to the SoftDevice and the
//! USB network stack.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod ble;
pub mod cache;
pub mod config;
pub mod error;
pub mod poller;
pub mod responder;
pub mod sensor;

pub use error::{Error, Result};
