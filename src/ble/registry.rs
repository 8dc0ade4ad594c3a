//! Remote peripherals the hub must find before it can connect.

use heapless::String;

use crate::ble::Address;
use crate::config::BLE_NAME_MAX_LEN;
use crate::error::{Error, Result};

/// Index of a remote in the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RemoteId(pub usize);

/// Identity of one peripheral.
///
/// `found` is set by scan-result handling and cleared again by an
/// erroneous disconnect, forcing rediscovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDevice {
    name: String<BLE_NAME_MAX_LEN>,
    address: Option<Address>,
    found: bool,
}

impl RemoteDevice {
    pub fn new(name: &str) -> Result<Self> {
        let mut n = String::new();
        n.push_str(name).map_err(|_| Error::BufferOverflow)?;
        Ok(Self {
            name: n,
            address: None,
            found: false,
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Address from the most recent discovery.
    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Record a sighting. Returns `true` if the remote was not known before.
    ///
    /// A remote that is already found keeps its address until it is lost.
    pub fn mark_found(&mut self, address: Address) -> bool {
        if self.found {
            return false;
        }
        self.found = true;
        self.address = Some(address);
        true
    }

    pub fn mark_lost(&mut self) {
        self.found = false;
    }
}
