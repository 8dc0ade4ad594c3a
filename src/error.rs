//! Unified error type for the sensor hub.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

use thiserror::Error;

/// Top-level error type used across the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Configuration (fatal)
    /// A profile index (e.g. a registration app id) outside the roster.
    #[error("profile {index} outside roster of {len}")]
    RosterIndexOutOfRange { index: usize, len: usize },

    /// The stack refused to register a profile.
    #[error("registration of profile {0} failed")]
    RegistrationFailed(usize),

    /// The stack refused the static scan parameters.
    #[error("scan parameters rejected")]
    ScanParamsRejected,

    /// The roster holds more profiles than [`crate::config::MAX_PROFILES`].
    #[error("roster is full")]
    RosterFull,

    // Radio
    /// A scan, open or close is already outstanding.
    #[error("radio busy: {0:?}")]
    Busy(BusyReason),

    /// The profile has no open link.
    #[error("profile {0} is not connected")]
    NotConnected(usize),

    /// Scheduling found no profile that can be opened.
    #[error("no schedulable profile")]
    NothingSchedulable,

    /// The characteristic handle is unknown (discovery did not complete).
    #[error("profile {0} has no discovered characteristic")]
    NotDiscovered(usize),

    // Cache / protocol
    /// Sensor ordinal outside the known kinds.
    #[error("invalid sensor ordinal {0}")]
    InvalidSensor(u8),

    /// The request datagram was empty.
    #[error("empty request")]
    EmptyRequest,

    /// Buffer too small for the requested operation.
    #[error("buffer overflow")]
    BufferOverflow,

    // Network
    /// The datagram socket failed in a way that ends the serving window.
    #[error("socket failure")]
    Socket,
}

/// Which radio operation made a request fail with [`Error::Busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusyReason {
    Scanning,
    Opening,
    Closing,
}

pub type Result<T> = core::result::Result<T, Error>;
