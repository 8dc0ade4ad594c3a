//! Sensor kinds served by the hub.

use crate::error::{Error, Result};

/// Number of sensor kinds the cache tracks.
pub const SENSOR_COUNT: usize = 4;

/// Closed set of sensors the roster can carry.
///
/// The discriminant is the ordinal used on the wire (`'0'..'3'`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SensorKind {
    MagneticField = 0,
    Photocell = 1,
    TempDetector = 2,
    IrDetector = 3,
}

impl SensorKind {
    pub const ALL: [SensorKind; SENSOR_COUNT] = [
        SensorKind::MagneticField,
        SensorKind::Photocell,
        SensorKind::TempDetector,
        SensorKind::IrDetector,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(Error::InvalidSensor(ordinal))
    }

    /// Parse the ASCII digit used by the request protocol.
    pub fn from_ascii(byte: u8) -> Result<Self> {
        Self::from_ordinal(byte.wrapping_sub(b'0'))
    }
}

impl TryFrom<u8> for SensorKind {
    type Error = Error;

    fn try_from(ordinal: u8) -> Result<Self> {
        Self::from_ordinal(ordinal)
    }
}

/// Decode the little-endian `u16` a sensor peripheral serves.
///
/// Extra trailing bytes are ignored.
pub fn decode_value(data: &[u8]) -> Option<u16> {
    match data {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}
