//! Property-based tests for scheduling and the orchestrator state machine.
//! Random radio event streams must never break the busy/discovery invariants.

use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;

use sensor_hub::ble::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState};
use sensor_hub::ble::registry::RemoteId;
use sensor_hub::ble::roster::{next_schedulable, Roster};
use sensor_hub::ble::{
    AddrKind, Address, AdvData, Command, ConnId, DisconnectReason, GattIf, GattStatus,
    RadioEvent, ReadValue,
};
use sensor_hub::cache::SensorCache;
use sensor_hub::config::{BLE_ATT_MTU, SENSOR_CHAR_UUID, SENSOR_ROSTER, SENSOR_SERVICE_UUID};
use sensor_hub::poller::SensorPoller;

fn hub(cache: &SensorCache) -> Orchestrator<SensorPoller<'_>> {
    let mut roster = Roster::new();
    let mut poller = SensorPoller::new(cache, 1_000);
    for (name, kind) in SENSOR_ROSTER {
        let id = roster
            .add(name, SENSOR_SERVICE_UUID, SENSOR_CHAR_UUID)
            .unwrap();
        poller.add(RemoteId(id), kind).unwrap();
    }
    let mut hub = Orchestrator::new(roster, poller, OrchestratorConfig::DEFAULT);
    hub.start();
    for i in 0..SENSOR_ROSTER.len() {
        hub.step(RadioEvent::Registered {
            app_id: i,
            gatt_if: GattIf(i as u8),
            status: GattStatus::Success,
        })
        .unwrap();
    }
    hub
}

fn report(i: usize) -> RadioEvent {
    let name = SENSOR_ROSTER[i].0;
    let mut adv = AdvData::new();
    adv.push(name.len() as u8 + 1).unwrap();
    adv.push(0x09).unwrap();
    adv.extend_from_slice(name.as_bytes()).unwrap();
    RadioEvent::ScanReport {
        address: Address::new(AddrKind::Public, [i as u8; 6]),
        adv,
    }
}

fn gatt_if() -> impl Strategy<Value = GattIf> {
    (0u8..4).prop_map(GattIf)
}

fn status() -> impl Strategy<Value = GattStatus> {
    prop_oneof![
        3 => Just(GattStatus::Success),
        1 => Just(GattStatus::Failed(0x85)),
    ]
}

fn reason() -> impl Strategy<Value = DisconnectReason> {
    prop_oneof![
        Just(DisconnectReason::LocalHostTerminated),
        Just(DisconnectReason::RemoteUserTerminated),
        Just(DisconnectReason::ConnectionTimeout),
        Just(DisconnectReason::FailedToEstablish),
    ]
}

/// Commands the stack may refuse without the failure being fatal.
fn refused() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::StartScan { duration_secs: 3 }),
        Just(Command::StopScan),
        gatt_if().prop_map(|gatt_if| Command::Open {
            gatt_if,
            address: Address::new(AddrKind::Public, [gatt_if.0; 6]),
        }),
        gatt_if().prop_map(|gatt_if| Command::Close {
            gatt_if,
            conn_id: ConnId(1),
        }),
        gatt_if().prop_map(|gatt_if| Command::ReadCharacteristic {
            gatt_if,
            conn_id: ConnId(1),
            handle: 0x2A,
        }),
    ]
}

fn event() -> impl Strategy<Value = RadioEvent> {
    prop_oneof![
        (0usize..4).prop_map(report),
        Just(RadioEvent::ScanComplete),
        Just(RadioEvent::ScanStopped),
        (gatt_if(), status(), 1u16..8).prop_map(|(gatt_if, status, c)| RadioEvent::Opened {
            gatt_if,
            status,
            conn_id: ConnId(c),
        }),
        (gatt_if(), status(), prop_oneof![Just(BLE_ATT_MTU), Just(23u16)]).prop_map(
            |(gatt_if, status, mtu)| RadioEvent::MtuConfigured {
                gatt_if,
                status,
                mtu,
            }
        ),
        gatt_if().prop_map(|gatt_if| RadioEvent::ServiceFound {
            gatt_if,
            uuid: SENSOR_SERVICE_UUID,
            start_handle: 0x28,
            end_handle: 0x2F,
        }),
        (gatt_if(), status())
            .prop_map(|(gatt_if, status)| RadioEvent::ServiceSearchComplete { gatt_if, status }),
        (gatt_if(), status(), 0u16..3, 0u16..3).prop_map(|(gatt_if, status, total, matches)| {
            RadioEvent::CharacteristicsResolved {
                gatt_if,
                status,
                total,
                matches,
                handle: 0x2A,
            }
        }),
        (gatt_if(), status(), vec(any::<u8>(), 0..4)).prop_map(|(gatt_if, status, value)| {
            RadioEvent::ReadComplete {
                gatt_if,
                status,
                value: ReadValue::from_slice(&value).unwrap(),
            }
        }),
        gatt_if().prop_map(|gatt_if| RadioEvent::Closed { gatt_if }),
        (gatt_if(), reason())
            .prop_map(|(gatt_if, reason)| RadioEvent::Disconnected { gatt_if, reason }),
        refused().prop_map(RadioEvent::CommandFailed),
    ]
}

fn claims_radio(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::StartScan { .. } | Command::Open { .. } | Command::Close { .. }
    )
}

proptest::proptest! {
    /// The pick is the first eligible index strictly after the cursor, wrapping.
    #[test]
    fn picks_first_eligible_after_cursor(
        mask in vec(any::<bool>(), 1..=8),
        cursor in option::of(0usize..8),
    ) {
        let len = mask.len();
        let cursor = cursor.map(|c| c % len);
        match next_schedulable(cursor, len, |i| mask[i]) {
            None => prop_assert!(mask.iter().all(|m| !m)),
            Some(picked) => {
                prop_assert!(mask[picked]);
                let mut i = cursor.map_or(0, |c| (c + 1) % len);
                while i != picked {
                    prop_assert!(!mask[i], "skipped eligible index {}", i);
                    i = (i + 1) % len;
                }
            }
        }
    }

    /// Following the cursor visits every eligible index exactly once per cycle.
    #[test]
    fn round_robin_covers_every_eligible_profile(mask in vec(any::<bool>(), 1..=8)) {
        let len = mask.len();
        let eligible = mask.iter().filter(|m| **m).count();
        let mut seen = vec![0usize; len];
        let mut cursor = None;
        for _ in 0..eligible {
            let picked = next_schedulable(cursor, len, |i| mask[i]).unwrap();
            seen[picked] += 1;
            cursor = Some(picked);
        }
        for i in 0..len {
            prop_assert_eq!(seen[i], usize::from(mask[i]));
        }
    }

    /// Arbitrary event streams never fail, never claim the radio twice in one
    /// step, and never leave discovery results on a closed link.
    #[test]
    fn random_events_keep_invariants(events in vec(event(), 1..120)) {
        let cache = SensorCache::new();
        let mut hub = hub(&cache);

        for event in events {
            let erroneous_for = match &event {
                RadioEvent::Disconnected { gatt_if, reason }
                    if *reason != DisconnectReason::LocalHostTerminated =>
                {
                    let id = usize::from(gatt_if.0);
                    hub.remote(id).filter(|r| r.is_found()).map(|_| id)
                }
                _ => None,
            };

            let out = hub.step(event).unwrap();

            prop_assert!(out.iter().filter(|c| claims_radio(c)).count() <= 1);
            match hub.state() {
                OrchestratorState::Idle | OrchestratorState::Scanning => {}
                OrchestratorState::Opening(id) | OrchestratorState::Closing(id) => {
                    prop_assert!(id < SENSOR_ROSTER.len());
                }
            }
            for profile in hub.roster().profiles() {
                if !profile.is_open() {
                    prop_assert!(!profile.service().found);
                    prop_assert!(profile.characteristic().handle.is_none());
                }
            }
            if let Some(id) = erroneous_for {
                prop_assert!(!hub.remote(id).unwrap().is_found());
                prop_assert!(!matches!(
                    hub.state(),
                    OrchestratorState::Opening(_) | OrchestratorState::Closing(_)
                ));
            }
        }
    }
}
