//! Sensor polling policy.
//!
//! One read per connection cycle: read on discovery, cache the value, close.
//! A sensor joins the round with its first successful read and leaves it when
//! its remote is lost or a link to it closes without a reading. When every
//! sensor in the round is polled, the round restarts and the responder gets a
//! serving window.

use heapless::Vec;

use crate::ble::handler::{
    FallbackContext, ProfileContext, ProfileEvent, ProfileHandler, ScanFallback,
};
use crate::ble::registry::RemoteId;
use crate::ble::GattStatus;
use crate::cache::SensorCache;
use crate::config::MAX_PROFILES;
use crate::error::{Error, Result};
use crate::sensor::{decode_value, SensorKind};

/// Round bookkeeping for one peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RemoteSensor {
    remote: RemoteId,
    kind: SensorKind,
    /// Takes part in the round: read at least once and not lost since.
    found: bool,
    /// Read in the current round.
    polled: bool,
    /// Read on the link that is currently open.
    read_on_link: bool,
}

impl RemoteSensor {
    pub fn remote(&self) -> RemoteId {
        self.remote
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn is_polled(&self) -> bool {
        self.polled
    }
}

pub struct SensorPoller<'c> {
    cache: &'c SensorCache,
    sensors: Vec<RemoteSensor, MAX_PROFILES>,
    serve_period_ms: u32,
    rounds: u32,
}

impl<'c> SensorPoller<'c> {
    pub fn new(cache: &'c SensorCache, serve_period_ms: u32) -> Self {
        Self {
            cache,
            sensors: Vec::new(),
            serve_period_ms,
            rounds: 0,
        }
    }

    /// Associate a roster remote with the sensor it carries.
    pub fn add(&mut self, remote: RemoteId, kind: SensorKind) -> Result<()> {
        self.sensors
            .push(RemoteSensor {
                remote,
                kind,
                found: false,
                polled: false,
                read_on_link: false,
            })
            .map_err(|_| Error::RosterFull)
    }

    pub fn sensors(&self) -> &[RemoteSensor] {
        &self.sensors
    }

    /// Completed polling rounds.
    pub fn round(&self) -> u32 {
        self.rounds
    }

    fn sensor_mut(&mut self, remote: RemoteId) -> Option<&mut RemoteSensor> {
        self.sensors.iter_mut().find(|s| s.remote == remote)
    }

    fn close(cx: &mut ProfileContext<'_>) {
        if let Err(e) = cx.request_close() {
            error!("profile {}: close failed: {:?}", cx.profile_id(), e);
        }
    }

    fn on_discovered(&mut self, cx: &mut ProfileContext<'_>) {
        if let Err(e) = cx.read_characteristic() {
            error!("profile {}: could not issue read: {:?}", cx.profile_id(), e);
            Self::close(cx);
        }
    }

    fn on_read(&mut self, status: GattStatus, value: &[u8], cx: &mut ProfileContext<'_>) {
        if !status.is_ok() {
            warn!("{}: read failed: {:?}", cx.remote_name(), status);
            Self::close(cx);
            return;
        }
        let Some(reading) = decode_value(value) else {
            warn!("{}: short read ({} bytes)", cx.remote_name(), value.len());
            Self::close(cx);
            return;
        };
        let remote = cx.remote_id();
        match self.sensor_mut(remote) {
            Some(sensor) => {
                sensor.found = true;
                sensor.polled = true;
                sensor.read_on_link = true;
                let kind = sensor.kind;
                self.cache.set(kind, reading);
                info!("{} read {:?} = {}", cx.remote_name(), kind, reading);
            }
            None => warn!("{}: no sensor mapped, value dropped", cx.remote_name()),
        }
        Self::close(cx);
    }

    fn on_closed(&mut self, cx: &mut ProfileContext<'_>) {
        if let Some(sensor) = self.sensor_mut(cx.remote_id()) {
            if !sensor.read_on_link && sensor.found {
                warn!("{}: closed without a reading, leaving the round", cx.remote_name());
                sensor.found = false;
            }
            sensor.read_on_link = false;
        }
        let roster = cx.roster();
        for sensor in self.sensors.iter_mut() {
            if roster.remote(sensor.remote).is_some_and(|r| !r.is_found()) {
                sensor.found = false;
            }
        }

        if self.sensors.iter().any(|s| s.found && !s.polled) {
            trace!("round {}: not all found sensors polled", self.rounds);
            return;
        }
        for sensor in self.sensors.iter_mut() {
            sensor.polled = false;
        }
        self.rounds = self.rounds.wrapping_add(1);
        info!("round {} complete, serving requests", self.rounds);
        cx.serve_requests(self.serve_period_ms);
    }
}

impl ProfileHandler for SensorPoller<'_> {
    fn on_profile_event(&mut self, event: ProfileEvent<'_>, cx: &mut ProfileContext<'_>) {
        match event {
            ProfileEvent::DiscoveryComplete => self.on_discovered(cx),
            ProfileEvent::ReadComplete { status, value } => self.on_read(status, value, cx),
            ProfileEvent::Closed => self.on_closed(cx),
        }
    }
}

/// Serve cached values while there is nothing to connect to.
#[derive(Clone, Copy, Debug)]
pub struct ServeWhenIdle {
    pub period_ms: u32,
}

impl ScanFallback for ServeWhenIdle {
    fn on_scan_idle(&mut self, cx: &mut FallbackContext<'_>) {
        cx.serve_requests(self.period_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::ble::roster::Roster;
    use crate::ble::{
        AddrKind, Address, AdvData, Command, ConnId, GattIf, RadioEvent, ReadValue, Uuid16,
    };
    use crate::config::BLE_ATT_MTU;

    const PERIOD: u32 = 10_000;

    fn hub(cache: &SensorCache, n: usize) -> Orchestrator<SensorPoller<'_>> {
        let mut roster = Roster::new();
        let mut poller = SensorPoller::new(cache, PERIOD);
        for (i, kind) in SensorKind::ALL.iter().take(n).enumerate() {
            let id = roster
                .add(["r0", "r1", "r2", "r3"][i], Uuid16(0x00FF), Uuid16(0xFF01))
                .unwrap();
            poller.add(RemoteId(id), *kind).unwrap();
        }
        let mut o = Orchestrator::new(roster, poller, OrchestratorConfig::DEFAULT);
        for i in 0..n {
            o.step(RadioEvent::Registered {
                app_id: i,
                gatt_if: GattIf(i as u8),
                status: GattStatus::Success,
            })
            .unwrap();
        }
        o
    }

    fn find(o: &mut Orchestrator<SensorPoller<'_>>, i: usize) {
        let name = ["r0", "r1", "r2", "r3"][i];
        let mut adv = AdvData::new();
        adv.extend_from_slice(&[name.len() as u8 + 1, 0x09]).unwrap();
        adv.extend_from_slice(name.as_bytes()).unwrap();
        o.step(RadioEvent::ScanReport {
            address: Address::new(AddrKind::Random, [i as u8; 6]),
            adv,
        })
        .unwrap();
    }

    /// Run one full connection cycle for profile `i` and return the
    /// commands emitted by the final close.
    fn cycle(
        o: &mut Orchestrator<SensorPoller<'_>>,
        i: usize,
        payload: &[u8],
    ) -> crate::ble::Commands {
        cycle_with(o, i, GattStatus::Success, payload)
    }

    fn cycle_with(
        o: &mut Orchestrator<SensorPoller<'_>>,
        i: usize,
        read_status: GattStatus,
        payload: &[u8],
    ) -> crate::ble::Commands {
        let g = GattIf(i as u8);
        let steps = [
            RadioEvent::Opened {
                gatt_if: g,
                status: GattStatus::Success,
                conn_id: ConnId(i as u16),
            },
            RadioEvent::MtuConfigured {
                gatt_if: g,
                status: GattStatus::Success,
                mtu: BLE_ATT_MTU,
            },
            RadioEvent::ServiceFound {
                gatt_if: g,
                uuid: Uuid16(0x00FF),
                start_handle: 10,
                end_handle: 14,
            },
            RadioEvent::ServiceSearchComplete {
                gatt_if: g,
                status: GattStatus::Success,
            },
            RadioEvent::CharacteristicsResolved {
                gatt_if: g,
                status: GattStatus::Success,
                total: 1,
                matches: 1,
                handle: 12,
            },
            RadioEvent::ReadComplete {
                gatt_if: g,
                status: read_status,
                value: ReadValue::from_slice(payload).unwrap(),
            },
        ];
        for ev in steps {
            o.step(ev).unwrap();
        }
        o.step(RadioEvent::Closed { gatt_if: g }).unwrap()
    }

    #[test]
    fn read_value_lands_in_cache() {
        let cache = SensorCache::new();
        let mut o = hub(&cache, 2);
        find(&mut o, 0);
        find(&mut o, 1);
        o.step(RadioEvent::ScanStopped).unwrap();

        cycle(&mut o, 0, &[0x2A, 0x00]);
        assert_eq!(cache.get(SensorKind::MagneticField), 42);
        let s = o.handler().sensors()[0];
        assert!(s.is_found());
        assert!(!o.handler().sensors()[1].is_found());
        // Sensor 0 was the whole round, so it is already reset.
        assert!(!s.is_polled());
        assert_eq!(o.handler().round(), 1);
    }

    fn serves(out: &crate::ble::Commands) -> bool {
        out.iter()
            .any(|c| matches!(c, Command::ServeRequests { .. }))
    }

    #[test]
    fn serving_once_per_round() {
        let cache = SensorCache::new();
        let mut o = hub(&cache, 2);
        find(&mut o, 0);
        find(&mut o, 1);
        o.step(RadioEvent::ScanStopped).unwrap();

        // The first reading is a complete round on its own.
        let out = cycle(&mut o, 0, &[1, 0]);
        assert_eq!(out[0], Command::ServeRequests { period_ms: PERIOD });
        assert_eq!(o.handler().round(), 1);

        // Sensor 1 joins; sensor 0 has not been read again yet.
        let out = cycle(&mut o, 1, &[2, 0]);
        assert!(!serves(&out));
        assert_eq!(o.handler().round(), 1);

        let out = cycle(&mut o, 0, &[3, 0]);
        assert_eq!(out[0], Command::ServeRequests { period_ms: PERIOD });
        assert_eq!(o.handler().round(), 2);
        assert!(o.handler().sensors().iter().all(|s| !s.is_polled()));
        assert_eq!(cache.snapshot(), [3, 2, 0, 0]);
    }

    #[test]
    fn unreadable_sensor_leaves_the_round() {
        let cache = SensorCache::new();
        let mut o = hub(&cache, 2);
        find(&mut o, 0);
        find(&mut o, 1);
        o.step(RadioEvent::ScanStopped).unwrap();

        cycle(&mut o, 0, &[1, 0]);
        assert!(!serves(&cycle(&mut o, 1, &[2, 0])));

        // Sensor 0 still advertises but its reads now fail.
        let out = cycle_with(&mut o, 0, GattStatus::Failed(0x0A), &[]);
        assert!(!o.handler().sensors()[0].is_found());
        assert!(o.remote(0).unwrap().is_found());
        assert!(serves(&out));
        assert_eq!(o.handler().round(), 2);

        // It rejoins with its next good reading.
        cycle(&mut o, 1, &[4, 0]);
        let out = cycle(&mut o, 0, &[5, 0]);
        assert!(o.handler().sensors()[0].is_found());
        assert!(!serves(&out));
        assert_eq!(cache.snapshot(), [5, 4, 0, 0]);
    }

    #[test]
    fn lost_remote_leaves_the_round() {
        let cache = SensorCache::new();
        let mut o = hub(&cache, 2);
        find(&mut o, 0);
        find(&mut o, 1);
        o.step(RadioEvent::ScanStopped).unwrap();
        cycle(&mut o, 0, &[1, 0]);
        cycle(&mut o, 1, &[2, 0]);

        // Sensor 0's link drops mid-discovery.
        o.step(RadioEvent::Opened {
            gatt_if: GattIf(0),
            status: GattStatus::Success,
            conn_id: ConnId(7),
        })
        .unwrap();
        o.step(RadioEvent::Disconnected {
            gatt_if: GattIf(0),
            reason: crate::ble::DisconnectReason::ConnectionTimeout,
        })
        .unwrap();
        let out = o.step(RadioEvent::Closed { gatt_if: GattIf(0) }).unwrap();

        assert!(!o.handler().sensors()[0].is_found());
        assert!(o.handler().sensors()[1].is_found());
        // Sensor 1 is the whole round now, and it was polled.
        assert!(serves(&out));
    }

    #[test]
    fn failed_read_closes_without_caching() {
        let cache = SensorCache::new();
        let mut o = hub(&cache, 1);
        find(&mut o, 0);
        o.step(RadioEvent::ScanStopped).unwrap();
        let g = GattIf(0);
        for ev in [
            RadioEvent::Opened {
                gatt_if: g,
                status: GattStatus::Success,
                conn_id: ConnId(1),
            },
            RadioEvent::MtuConfigured {
                gatt_if: g,
                status: GattStatus::Success,
                mtu: BLE_ATT_MTU,
            },
            RadioEvent::ServiceFound {
                gatt_if: g,
                uuid: Uuid16(0x00FF),
                start_handle: 1,
                end_handle: 4,
            },
            RadioEvent::ServiceSearchComplete {
                gatt_if: g,
                status: GattStatus::Success,
            },
            RadioEvent::CharacteristicsResolved {
                gatt_if: g,
                status: GattStatus::Success,
                total: 1,
                matches: 1,
                handle: 3,
            },
        ] {
            o.step(ev).unwrap();
        }
        let out = o
            .step(RadioEvent::ReadComplete {
                gatt_if: g,
                status: GattStatus::Failed(0x05),
                value: ReadValue::new(),
            })
            .unwrap();
        assert!(matches!(out[0], Command::Close { .. }));
        assert_eq!(cache.get(SensorKind::MagneticField), 0);

        // Nothing in the round yet, so the responder still gets its window.
        let out = o.step(RadioEvent::Closed { gatt_if: g }).unwrap();
        assert!(serves(&out));
        assert!(!o.handler().sensors()[0].is_found());
    }

    #[test]
    fn short_payload_is_discarded() {
        let cache = SensorCache::new();
        cache.set(SensorKind::MagneticField, 7);
        let mut o = hub(&cache, 1);
        find(&mut o, 0);
        o.step(RadioEvent::ScanStopped).unwrap();
        cycle(&mut o, 0, &[0x01]);
        assert_eq!(cache.get(SensorKind::MagneticField), 7);
        assert!(!o.handler().sensors()[0].is_polled());
    }

    #[test]
    fn unmapped_remote_only_warns() {
        let cache = SensorCache::new();
        let mut roster = Roster::new();
        roster.add("r0", Uuid16(0x00FF), Uuid16(0xFF01)).unwrap();
        let poller = SensorPoller::new(&cache, PERIOD);
        let mut o = Orchestrator::new(roster, poller, OrchestratorConfig::DEFAULT);
        o.step(RadioEvent::Registered {
            app_id: 0,
            gatt_if: GattIf(0),
            status: GattStatus::Success,
        })
        .unwrap();
        find(&mut o, 0);
        o.step(RadioEvent::ScanStopped).unwrap();
        cycle(&mut o, 0, &[9, 0]);
        assert_eq!(cache.snapshot(), [0; 4]);
        assert!(o.handler().sensors().is_empty());
    }

    #[test]
    fn serve_when_idle_emits_window() {
        let cache = SensorCache::new();
        let mut roster = Roster::new();
        roster.add("r0", Uuid16(0x00FF), Uuid16(0xFF01)).unwrap();
        let poller = SensorPoller::new(&cache, PERIOD);
        let mut o = Orchestrator::new(roster, poller, OrchestratorConfig::DEFAULT)
            .with_fallback(ServeWhenIdle { period_ms: 1_234 });
        o.step(RadioEvent::Registered {
            app_id: 0,
            gatt_if: GattIf(0),
            status: GattStatus::Success,
        })
        .unwrap();
        let out = o.step(RadioEvent::ScanComplete).unwrap();
        assert_eq!(out[0], Command::ServeRequests { period_ms: 1_234 });
    }

    #[test]
    fn add_is_bounded() {
        let cache = SensorCache::new();
        let mut poller = SensorPoller::new(&cache, PERIOD);
        for i in 0..MAX_PROFILES {
            poller.add(RemoteId(i), SensorKind::Photocell).unwrap();
        }
        assert_eq!(
            poller.add(RemoteId(99), SensorKind::Photocell),
            Err(Error::RosterFull)
        );
    }
}
