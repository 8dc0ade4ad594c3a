//! Bluetooth Low Energy central subsystem.
//!
//! The hub drives the radio in **Central** role through a single,
//! synchronous state machine:
//!
//! 1. **Registry / Roster** - the fixed set of named peripherals and the
//!    connection profile bound to each of them.
//! 2. **Orchestrator** - consumes [`RadioEvent`]s and answers with
//!    [`Command`]s: scan, open, negotiate MTU, discover, read, close.
//! 3. **Handlers** - per-profile policy plugged into the orchestrator
//!    (see [`crate::poller`]).
//!
//! The board adapter owns the real radio API. It executes the returned
//! commands in order and feeds every stack completion back as an event.

pub mod adv_parser;
pub mod handler;
pub mod orchestrator;
pub mod profile;
pub mod registry;
pub mod roster;

use heapless::Vec;

use crate::config::{BLE_READ_MAX_LEN, BLE_SCAN_INTERVAL, BLE_SCAN_WINDOW};

/// Index of a profile in the roster. Stable for the process lifetime.
pub type ProfileId = usize;

/// Raw advertising payload (advertisement + scan response).
pub type AdvData = Vec<u8, 62>;

/// Characteristic value as delivered by a read.
pub type ReadValue = Vec<u8, BLE_READ_MAX_LEN>;

/// Commands produced by a single orchestrator step.
pub type Commands = Vec<Command, 16>;

/// 16-bit Bluetooth SIG / vendor UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Uuid16(pub u16);

/// Stack-assigned interface handle of a registered profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GattIf(pub u8);

/// Virtual connection id of an open link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnId(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddrKind {
    Public,
    Random,
}

/// BLE device address as learned from a scan report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    pub kind: AddrKind,
    pub bytes: [u8; 6],
}

impl Address {
    pub const fn new(kind: AddrKind, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }
}

/// Completion status of a GATT procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattStatus {
    Success,
    /// Stack-specific error code.
    Failed(u16),
}

impl GattStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// HCI disconnect reason, as far as the orchestrator distinguishes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// 0x16 - we closed the link.
    LocalHostTerminated,
    /// 0x13 - the peripheral closed the link.
    RemoteUserTerminated,
    /// 0x08 - supervision timeout.
    ConnectionTimeout,
    /// 0x3E - the link never came up.
    FailedToEstablish,
    Other(u8),
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x16 => DisconnectReason::LocalHostTerminated,
            0x13 => DisconnectReason::RemoteUserTerminated,
            0x08 => DisconnectReason::ConnectionTimeout,
            0x3E => DisconnectReason::FailedToEstablish,
            other => DisconnectReason::Other(other),
        }
    }
}

/// Which disconnect reasons count as "erroneous" and force a rediscovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectPolicy {
    /// Anything but a local-host terminate is erroneous.
    Strict,
    /// Remote-user terminate is treated like a local one.
    Lenient,
}

impl DisconnectPolicy {
    pub fn is_erroneous(self, reason: DisconnectReason) -> bool {
        match (self, reason) {
            (_, DisconnectReason::LocalHostTerminated) => false,
            (DisconnectPolicy::Lenient, DisconnectReason::RemoteUserTerminated) => false,
            _ => true,
        }
    }
}

/// Static GAP scan parameters, set once at start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    /// Active scan (request scan responses, which carry names).
    pub active: bool,
    /// Interval in 0.625 ms units.
    pub interval: u16,
    /// Window in 0.625 ms units.
    pub window: u16,
}

impl ScanParams {
    pub const DEFAULT: ScanParams = ScanParams {
        active: true,
        interval: BLE_SCAN_INTERVAL,
        window: BLE_SCAN_WINDOW,
    };
}

impl Default for ScanParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Completions and indications delivered by the radio stack.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioEvent {
    /// A profile registration finished.
    Registered {
        app_id: usize,
        gatt_if: GattIf,
        status: GattStatus,
    },
    /// One advertisement seen while scanning.
    ScanReport { address: Address, adv: AdvData },
    /// The scan duration elapsed.
    ScanComplete,
    /// A requested scan stop finished.
    ScanStopped,
    Opened {
        gatt_if: GattIf,
        status: GattStatus,
        conn_id: ConnId,
    },
    MtuConfigured {
        gatt_if: GattIf,
        status: GattStatus,
        mtu: u16,
    },
    /// One primary service matched by a service search.
    ServiceFound {
        gatt_if: GattIf,
        uuid: Uuid16,
        start_handle: u16,
        end_handle: u16,
    },
    ServiceSearchComplete { gatt_if: GattIf, status: GattStatus },
    /// Characteristic lookup inside the target service's handle range.
    CharacteristicsResolved {
        gatt_if: GattIf,
        status: GattStatus,
        /// Characteristics in the service.
        total: u16,
        /// Characteristics matching the target UUID.
        matches: u16,
        /// Value handle of the first match.
        handle: u16,
    },
    ReadComplete {
        gatt_if: GattIf,
        status: GattStatus,
        value: ReadValue,
    },
    Closed { gatt_if: GattIf },
    /// Physical link loss. The stack may deliver this to every profile.
    Disconnected {
        gatt_if: GattIf,
        reason: DisconnectReason,
    },
    /// The stack refused a command outright.
    CommandFailed(Command),
}

/// Work the board adapter must carry out, in order.
///
/// Every radio command is fire-and-forget; its outcome comes back as a
/// [`RadioEvent`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    SetScanParams(ScanParams),
    RegisterApp {
        app_id: usize,
    },
    StartScan {
        duration_secs: u32,
    },
    StopScan,
    Open {
        gatt_if: GattIf,
        address: Address,
    },
    ConfigureMtu {
        gatt_if: GattIf,
        conn_id: ConnId,
        mtu: u16,
    },
    SearchService {
        gatt_if: GattIf,
        conn_id: ConnId,
        uuid: Uuid16,
    },
    ResolveCharacteristic {
        gatt_if: GattIf,
        conn_id: ConnId,
        start_handle: u16,
        end_handle: u16,
        uuid: Uuid16,
    },
    ReadCharacteristic {
        gatt_if: GattIf,
        conn_id: ConnId,
        handle: u16,
    },
    Close {
        gatt_if: GattIf,
        conn_id: ConnId,
    },
    /// Wait before the next command.
    Pause {
        ms: u32,
    },
    /// Run the responder's serving window. Blocks the BLE task while it runs.
    ServeRequests {
        period_ms: u32,
    },
}

pub(crate) fn emit(out: &mut Commands, cmd: Command) {
    if out.push(cmd).is_err() {
        error!("command queue full, dropping command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_policy_flags_everything_but_local_terminate() {
        let p = DisconnectPolicy::Strict;
        assert!(!p.is_erroneous(DisconnectReason::LocalHostTerminated));
        assert!(p.is_erroneous(DisconnectReason::RemoteUserTerminated));
        assert!(p.is_erroneous(DisconnectReason::ConnectionTimeout));
        assert!(p.is_erroneous(DisconnectReason::FailedToEstablish));
        assert!(p.is_erroneous(DisconnectReason::Other(0x22)));
    }

    #[test]
    fn lenient_policy_accepts_remote_terminate() {
        let p = DisconnectPolicy::Lenient;
        assert!(!p.is_erroneous(DisconnectReason::LocalHostTerminated));
        assert!(!p.is_erroneous(DisconnectReason::RemoteUserTerminated));
        assert!(p.is_erroneous(DisconnectReason::ConnectionTimeout));
    }

    #[test]
    fn disconnect_reason_from_hci_code() {
        assert_eq!(DisconnectReason::from(0x16), DisconnectReason::LocalHostTerminated);
        assert_eq!(DisconnectReason::from(0x13), DisconnectReason::RemoteUserTerminated);
        assert_eq!(DisconnectReason::from(0x08), DisconnectReason::ConnectionTimeout);
        assert_eq!(DisconnectReason::from(0x3E), DisconnectReason::FailedToEstablish);
        assert_eq!(DisconnectReason::from(0x05), DisconnectReason::Other(0x05));
    }
}
