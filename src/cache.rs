//! Latest-value cache shared by the polling task and the responder.
//!
//! Each entry is a single `AtomicU16`, so a reader on another task (or
//! interrupt priority) never observes a partially written value. Entries
//! that were never written read as 0.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::error::Result;
use crate::sensor::{SensorKind, SENSOR_COUNT};

pub struct SensorCache {
    values: [AtomicU16; SENSOR_COUNT],
}

impl SensorCache {
    pub const fn new() -> Self {
        Self {
            values: [
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
            ],
        }
    }

    pub fn get(&self, kind: SensorKind) -> u16 {
        self.values[kind.index()].load(Ordering::Acquire)
    }

    pub fn set(&self, kind: SensorKind, value: u16) {
        self.values[kind.index()].store(value, Ordering::Release);
    }

    /// Store by wire ordinal; unknown ordinals leave the cache untouched.
    pub fn set_ordinal(&self, ordinal: u8, value: u16) -> Result<()> {
        let kind = SensorKind::from_ordinal(ordinal)?;
        self.set(kind, value);
        Ok(())
    }

    /// Snapshot of every entry, in ordinal order.
    pub fn snapshot(&self) -> [u16; SENSOR_COUNT] {
        let mut out = [0u16; SENSOR_COUNT];
        for kind in SensorKind::ALL {
            out[kind.index()] = self.get(kind);
        }
        out
    }
}

impl Default for SensorCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unset_entries_read_zero() {
        let cache = SensorCache::new();
        assert_eq!(cache.snapshot(), [0; SENSOR_COUNT]);
    }

    #[test]
    fn set_then_get() {
        let cache = SensorCache::new();
        cache.set(SensorKind::Photocell, 42);
        assert_eq!(cache.get(SensorKind::Photocell), 42);
        assert_eq!(cache.get(SensorKind::MagneticField), 0);
    }

    #[test]
    fn latest_write_wins() {
        let cache = SensorCache::new();
        cache.set(SensorKind::IrDetector, 1);
        cache.set(SensorKind::IrDetector, 4095);
        assert_eq!(cache.get(SensorKind::IrDetector), 4095);
    }

    #[test]
    fn set_ordinal_rejects_unknown_kind() {
        let cache = SensorCache::new();
        assert_eq!(cache.set_ordinal(7, 99), Err(Error::InvalidSensor(7)));
        assert_eq!(cache.snapshot(), [0; SENSOR_COUNT]);

        assert_eq!(cache.set_ordinal(2, 99), Ok(()));
        assert_eq!(cache.get(SensorKind::TempDetector), 99);
    }

    #[test]
    fn concurrent_readers_never_see_torn_values() {
        let cache = Arc::new(SensorCache::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..50_000u32 {
                    let v = if i % 2 == 0 { 0x00FF } else { 0xFF00 };
                    cache.set(SensorKind::TempDetector, v);
                }
                done.store(true, Ordering::Release);
            })
        };

        let reader = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let v = cache.get(SensorKind::TempDetector);
                    assert!(v == 0 || v == 0x00FF || v == 0xFF00, "torn read {v:#06x}");
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
