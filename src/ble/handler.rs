//! Policy hooks plugged into the orchestrator.
//!
//! A [`ProfileHandler`] sees the lifecycle of every profile in the roster
//! and answers through a [`ProfileContext`], which is the only way a handler
//! can issue radio commands. A [`ScanFallback`] runs when a finished scan
//! leaves nothing to open.

use crate::ble::orchestrator::{close_or_defer, DeferredCloses, OrchestratorState};
use crate::ble::profile::ConnectionProfile;
use crate::ble::registry::{RemoteDevice, RemoteId};
use crate::ble::roster::Roster;
use crate::ble::{emit, Command, Commands, GattStatus, ProfileId};
use crate::error::{Error, Result};

/// Lifecycle points at which a handler is invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileEvent<'a> {
    /// Service and characteristic are resolved; the link is ready.
    DiscoveryComplete,
    ReadComplete { status: GattStatus, value: &'a [u8] },
    /// The link closed and discovery results were dropped.
    Closed,
}

pub trait ProfileHandler {
    fn on_profile_event(&mut self, event: ProfileEvent<'_>, cx: &mut ProfileContext<'_>);
}

/// What a handler may see and do while it handles one event.
pub struct ProfileContext<'a> {
    pub(crate) roster: &'a Roster,
    pub(crate) profile: &'a ConnectionProfile,
    pub(crate) remote: &'a RemoteDevice,
    pub(crate) state: &'a mut OrchestratorState,
    pub(crate) deferred: &'a mut DeferredCloses,
    pub(crate) out: &'a mut Commands,
}

impl<'a> ProfileContext<'a> {
    pub fn profile_id(&self) -> ProfileId {
        self.profile.id()
    }

    pub fn remote_id(&self) -> RemoteId {
        self.profile.remote()
    }

    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    pub fn profile(&self) -> &ConnectionProfile {
        self.profile
    }

    /// The whole roster, read-only.
    pub fn roster(&self) -> &Roster {
        self.roster
    }

    /// Read the discovered characteristic once.
    pub fn read_characteristic(&mut self) -> Result<()> {
        let id = self.profile.id();
        let (Some(gatt_if), Some(conn_id)) = (self.profile.gatt_if(), self.profile.conn_id())
        else {
            return Err(Error::NotConnected(id));
        };
        let handle = self
            .profile
            .characteristic()
            .handle
            .ok_or(Error::NotDiscovered(id))?;
        emit(
            self.out,
            Command::ReadCharacteristic {
                gatt_if,
                conn_id,
                handle,
            },
        );
        Ok(())
    }

    /// Ask for this profile's link to be torn down.
    ///
    /// While a scan, open or close is outstanding the close is queued and
    /// issued as soon as the radio is free again.
    pub fn request_close(&mut self) -> Result<()> {
        close_or_defer(self.state, self.deferred, self.profile, self.out)
    }

    /// Hand the radio task over to the responder once the current step is
    /// done.
    pub fn serve_requests(&mut self, period_ms: u32) {
        emit(self.out, Command::ServeRequests { period_ms });
    }
}

/// Invoked when a completed scan yields nothing to open.
pub trait ScanFallback {
    fn on_scan_idle(&mut self, cx: &mut FallbackContext<'_>);
}

/// No fallback; the orchestrator rescans straight away.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFallback;

impl ScanFallback for NoFallback {
    fn on_scan_idle(&mut self, _cx: &mut FallbackContext<'_>) {}
}

pub struct FallbackContext<'a> {
    pub(crate) roster: &'a Roster,
    pub(crate) out: &'a mut Commands,
}

impl<'a> FallbackContext<'a> {
    pub fn roster(&self) -> &Roster {
        self.roster
    }

    pub fn serve_requests(&mut self, period_ms: u32) {
        emit(self.out, Command::ServeRequests { period_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{ConnId, GattIf, Uuid16};

    fn open_roster() -> Roster {
        let mut roster = Roster::new();
        roster.add("ESP32-TEST-0", Uuid16(0x00FF), Uuid16(0xFF01)).unwrap();
        let profile = roster.profile_mut(0).unwrap();
        profile.gatt_if = Some(GattIf(3));
        profile.mark_open(ConnId(9));
        roster
    }

    fn context<'a>(
        roster: &'a Roster,
        state: &'a mut OrchestratorState,
        deferred: &'a mut DeferredCloses,
        out: &'a mut Commands,
    ) -> ProfileContext<'a> {
        let (profile, remote) = roster.pair(0).unwrap();
        ProfileContext {
            roster,
            profile,
            remote,
            state,
            deferred,
            out,
        }
    }

    #[test]
    fn read_requires_discovered_handle() {
        let roster = open_roster();
        let mut state = OrchestratorState::Idle;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        assert_eq!(cx.read_characteristic(), Err(Error::NotDiscovered(0)));
        assert!(out.is_empty());
    }

    #[test]
    fn read_emits_command_for_open_link() {
        let mut roster = open_roster();
        roster.profile_mut(0).unwrap().characteristic.handle = Some(0x2A);
        let mut state = OrchestratorState::Idle;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        assert_eq!(cx.remote_name(), "ESP32-TEST-0");
        cx.read_characteristic().unwrap();
        assert_eq!(
            out.as_slice(),
            &[Command::ReadCharacteristic {
                gatt_if: GattIf(3),
                conn_id: ConnId(9),
                handle: 0x2A
            }]
        );
    }

    #[test]
    fn read_on_closed_link_fails() {
        let mut roster = open_roster();
        roster.profile_mut(0).unwrap().mark_closed();
        let mut state = OrchestratorState::Idle;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        assert_eq!(cx.read_characteristic(), Err(Error::NotConnected(0)));
    }

    #[test]
    fn close_deferred_while_scanning() {
        let roster = open_roster();
        let mut state = OrchestratorState::Scanning;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        cx.request_close().unwrap();
        // Asking twice queues the close once.
        cx.request_close().unwrap();
        assert_eq!(state, OrchestratorState::Scanning);
        assert!(out.is_empty());
        assert_eq!(deferred.as_slice(), &[0]);
    }

    #[test]
    fn close_on_closed_link_is_not_deferred() {
        let mut roster = open_roster();
        roster.profile_mut(0).unwrap().mark_closed();
        let mut state = OrchestratorState::Idle;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        assert_eq!(cx.request_close(), Err(Error::NotConnected(0)));
        assert!(deferred.is_empty());
    }

    #[test]
    fn close_moves_to_closing() {
        let roster = open_roster();
        let mut state = OrchestratorState::Idle;
        let mut deferred = DeferredCloses::new();
        let mut out = Commands::new();
        let mut cx = context(&roster, &mut state, &mut deferred, &mut out);
        cx.request_close().unwrap();
        assert_eq!(state, OrchestratorState::Closing(0));
        assert_eq!(
            out.as_slice(),
            &[Command::Close {
                gatt_if: GattIf(3),
                conn_id: ConnId(9)
            }]
        );
    }

    #[test]
    fn fallback_context_emits_serving_window() {
        let roster = open_roster();
        let mut out = Commands::new();
        let mut cx = FallbackContext {
            roster: &roster,
            out: &mut out,
        };
        assert_eq!(cx.roster().len(), 1);
        cx.serve_requests(1_000);
        assert_eq!(out.as_slice(), &[Command::ServeRequests { period_ms: 1_000 }]);
    }
}
