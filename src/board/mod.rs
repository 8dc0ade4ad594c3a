//! nRF52840 board glue.
//!
//! - `radio` - runs orchestrator commands on the S140 SoftDevice.
//! - `net`   - USB CDC-NCM link, embassy-net stack and the UDP responder.

pub mod net;
pub mod radio;
