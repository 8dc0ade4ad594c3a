//! Connection orchestrator: scan, open, discover, hand over, close, repeat.
//!
//! The radio supports one outstanding connection-management operation at a
//! time. [`OrchestratorState`] makes that explicit: it is `Scanning`,
//! `Opening(id)` or `Closing(id)` while such an operation is in flight, and
//! `Idle` otherwise. Every transition happens inside [`Orchestrator::step`],
//! which consumes one [`RadioEvent`] and returns the [`Command`]s the board
//! adapter must execute next.
//!
//! Returning to `Idle` always reselects: when every remote has been found the
//! next schedulable profile after the round-robin cursor is opened, otherwise
//! a scan starts. Closes asked for while the radio was busy go out first.

use crate::ble::adv_parser::extract_device_name;
use crate::ble::handler::{
    FallbackContext, NoFallback, ProfileContext, ProfileEvent, ProfileHandler, ScanFallback,
};
use crate::ble::profile::{ConnectionProfile, LinkPhase};
use crate::ble::registry::RemoteDevice;
use crate::ble::roster::{next_schedulable, Roster};
use crate::ble::{
    emit, Address, Command, Commands, ConnId, DisconnectPolicy, DisconnectReason, GattIf,
    GattStatus, ProfileId, RadioEvent, ScanParams, Uuid16,
};
use crate::config::{self, MAX_PROFILES};
use crate::error::{BusyReason, Error, Result};

/// Outcome of a characteristic lookup, as reported by the radio.
#[derive(Clone, Copy, Debug)]
struct CharLookup {
    status: GattStatus,
    total: u16,
    matches: u16,
    handle: u16,
}

/// Exclusive radio state. At most one operation is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OrchestratorState {
    Idle,
    Scanning,
    Opening(ProfileId),
    Closing(ProfileId),
}

impl OrchestratorState {
    pub fn is_idle(self) -> bool {
        self == OrchestratorState::Idle
    }

    /// Why a new scan, open or close would be rejected right now.
    pub fn busy_reason(self) -> Option<BusyReason> {
        match self {
            OrchestratorState::Idle => None,
            OrchestratorState::Scanning => Some(BusyReason::Scanning),
            OrchestratorState::Opening(_) => Some(BusyReason::Opening),
            OrchestratorState::Closing(_) => Some(BusyReason::Closing),
        }
    }

    fn ensure_idle(self) -> Result<()> {
        match self.busy_reason() {
            Some(reason) => Err(Error::Busy(reason)),
            None => Ok(()),
        }
    }
}

/// Policy knobs of the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OrchestratorConfig {
    pub scan: ScanParams,
    pub scan_duration_secs: u32,
    /// ATT MTU requested after open. Anything else from the peer closes the link.
    pub mtu: u16,
    /// Pause before rescanning after a scan that opened nothing.
    pub rescan_backoff_ms: u32,
    /// Pause before retrying a scan the radio refused.
    pub scan_retry_ms: u32,
    pub disconnect_policy: DisconnectPolicy,
}

impl OrchestratorConfig {
    pub const DEFAULT: OrchestratorConfig = OrchestratorConfig {
        scan: ScanParams::DEFAULT,
        scan_duration_secs: config::BLE_SCAN_DURATION_SECS,
        mtu: config::BLE_ATT_MTU,
        rescan_backoff_ms: config::BLE_RESCAN_BACKOFF_MS,
        scan_retry_ms: config::BLE_SCAN_RETRY_MS,
        disconnect_policy: config::BLE_DISCONNECT_POLICY,
    };
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Profiles whose close was requested while the radio was busy, oldest first.
pub type DeferredCloses = heapless::Vec<ProfileId, MAX_PROFILES>;

/// Close `profile`'s link if the radio is free.
pub(crate) fn issue_close(
    state: &mut OrchestratorState,
    profile: &ConnectionProfile,
    out: &mut Commands,
) -> Result<()> {
    if let Err(e) = state.ensure_idle() {
        debug!("close of profile {} rejected: {:?}", profile.id(), state);
        return Err(e);
    }
    let (Some(gatt_if), Some(conn_id)) = (profile.gatt_if(), profile.conn_id()) else {
        return Err(Error::NotConnected(profile.id()));
    };
    emit(out, Command::Close { gatt_if, conn_id });
    *state = OrchestratorState::Closing(profile.id());
    debug!("closing profile {}", profile.id());
    Ok(())
}

/// Close `profile`'s open link now, or queue the close until the radio is
/// free again.
pub(crate) fn close_or_defer(
    state: &mut OrchestratorState,
    deferred: &mut DeferredCloses,
    profile: &ConnectionProfile,
    out: &mut Commands,
) -> Result<()> {
    match issue_close(state, profile, out) {
        Err(Error::Busy(reason)) if profile.is_open() => {
            let id = profile.id();
            if !deferred.contains(&id) {
                deferred.push(id).map_err(|_| Error::Busy(reason))?;
            }
            debug!("close of profile {} deferred while {:?}", id, reason);
            Ok(())
        }
        result => result,
    }
}

pub struct Orchestrator<H, F = NoFallback> {
    roster: Roster,
    handler: H,
    fallback: Option<F>,
    config: OrchestratorConfig,
    state: OrchestratorState,
    /// Last scheduled profile; `None` until the first open.
    cursor: Option<ProfileId>,
    /// A `StopScan` is outstanding for the current scan.
    scan_stop_pending: bool,
    deferred: DeferredCloses,
}

impl<H: ProfileHandler> Orchestrator<H, NoFallback> {
    pub fn new(roster: Roster, handler: H, config: OrchestratorConfig) -> Self {
        Self {
            roster,
            handler,
            fallback: None,
            config,
            state: OrchestratorState::Idle,
            cursor: None,
            scan_stop_pending: false,
            deferred: DeferredCloses::new(),
        }
    }

    /// Install a fallback invoked when a finished scan opens nothing.
    pub fn with_fallback<G: ScanFallback>(self, fallback: G) -> Orchestrator<H, G> {
        Orchestrator {
            roster: self.roster,
            handler: self.handler,
            fallback: Some(fallback),
            config: self.config,
            state: self.state,
            cursor: self.cursor,
            scan_stop_pending: self.scan_stop_pending,
            deferred: self.deferred,
        }
    }
}

impl<H: ProfileHandler, F: ScanFallback> Orchestrator<H, F> {
    /// Replace (or, with `None`, remove) the fallback.
    pub fn set_fallback(&mut self, fallback: Option<F>) {
        self.fallback = fallback;
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn profile(&self, id: ProfileId) -> Option<&ConnectionProfile> {
        self.roster.profile(id)
    }

    pub fn remote(&self, id: ProfileId) -> Option<&RemoteDevice> {
        self.roster.remote_of(id)
    }

    pub fn cursor(&self) -> Option<ProfileId> {
        self.cursor
    }

    /// Closes waiting for the radio, oldest first.
    pub fn deferred_closes(&self) -> &[ProfileId] {
        &self.deferred
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Commands that bring the radio up: scan parameters, then one
    /// registration per profile. Scanning starts once registrations land.
    pub fn start(&mut self) -> Commands {
        let mut out = Commands::new();
        emit(&mut out, Command::SetScanParams(self.config.scan));
        for app_id in 0..self.roster.len() {
            emit(&mut out, Command::RegisterApp { app_id });
        }
        info!("starting orchestrator with {} profiles", self.roster.len());
        out
    }

    /// Tear down a profile's link.
    ///
    /// Rejected with [`Error::Busy`] while a scan, open or close is in flight.
    pub fn request_close(&mut self, id: ProfileId) -> Result<Commands> {
        let len = self.roster.len();
        let profile = self
            .roster
            .profile(id)
            .ok_or(Error::RosterIndexOutOfRange { index: id, len })?;
        let mut out = Commands::new();
        issue_close(&mut self.state, profile, &mut out)?;
        Ok(out)
    }

    /// Consume one radio event.
    ///
    /// Only configuration errors are returned; they are fatal. Every
    /// transient failure is recovered inside the machine.
    pub fn step(&mut self, event: RadioEvent) -> Result<Commands> {
        let mut out = Commands::new();
        match event {
            RadioEvent::Registered {
                app_id,
                gatt_if,
                status,
            } => self.on_registered(app_id, gatt_if, status, &mut out)?,
            RadioEvent::ScanReport { address, adv } => {
                self.on_scan_report(address, &adv, &mut out)
            }
            RadioEvent::ScanComplete | RadioEvent::ScanStopped => self.on_scan_finished(&mut out),
            RadioEvent::Opened {
                gatt_if,
                status,
                conn_id,
            } => self.on_opened(gatt_if, status, conn_id, &mut out),
            RadioEvent::MtuConfigured {
                gatt_if,
                status,
                mtu,
            } => self.on_mtu_configured(gatt_if, status, mtu, &mut out),
            RadioEvent::ServiceFound {
                gatt_if,
                uuid,
                start_handle,
                end_handle,
            } => self.on_service_found(gatt_if, uuid, start_handle, end_handle),
            RadioEvent::ServiceSearchComplete { gatt_if, status } => {
                self.on_service_search_complete(gatt_if, status, &mut out)
            }
            RadioEvent::CharacteristicsResolved {
                gatt_if,
                status,
                total,
                matches,
                handle,
            } => {
                let lookup = CharLookup {
                    status,
                    total,
                    matches,
                    handle,
                };
                self.on_characteristics_resolved(gatt_if, lookup, &mut out)
            }
            RadioEvent::ReadComplete {
                gatt_if,
                status,
                value,
            } => self.on_read_complete(gatt_if, status, &value, &mut out),
            RadioEvent::Closed { gatt_if } => self.on_closed(gatt_if, &mut out),
            RadioEvent::Disconnected { gatt_if, reason } => {
                self.on_disconnected(gatt_if, reason, &mut out)
            }
            RadioEvent::CommandFailed(cmd) => self.on_command_failed(cmd, &mut out)?,
        }
        Ok(out)
    }

    // - Registration & scanning -------------------------------------------

    fn on_registered(
        &mut self,
        app_id: usize,
        gatt_if: GattIf,
        status: GattStatus,
        out: &mut Commands,
    ) -> Result<()> {
        let len = self.roster.len();
        let Some(profile) = self.roster.profile_mut(app_id) else {
            error!("registration for app {} outside roster of {}", app_id, len);
            return Err(Error::RosterIndexOutOfRange { index: app_id, len });
        };
        if !status.is_ok() {
            error!("registration of profile {} failed: {:?}", app_id, status);
            return Err(Error::RegistrationFailed(app_id));
        }
        profile.gatt_if = Some(gatt_if);
        info!("profile {} registered on interface {}", app_id, gatt_if.0);
        self.reselect(out);
        Ok(())
    }

    fn on_scan_report(&mut self, address: Address, adv: &[u8], out: &mut Commands) {
        let Some(name) = extract_device_name(adv) else {
            return;
        };
        let Some(remote) = self.roster.remote_by_name_mut(&name) else {
            trace!("ignoring advertiser {}", name.as_str());
            return;
        };
        if remote.mark_found(address) {
            info!("found remote {} at {:?}", name.as_str(), address.bytes);
        }
        if self.state == OrchestratorState::Scanning
            && !self.scan_stop_pending
            && self.roster.all_remotes_found()
        {
            debug!("all remotes found, stopping scan");
            emit(out, Command::StopScan);
            self.scan_stop_pending = true;
        }
    }

    fn on_scan_finished(&mut self, out: &mut Commands) {
        self.scan_stop_pending = false;
        if self.state != OrchestratorState::Scanning {
            debug!("scan end while {:?}, ignoring", self.state);
            return;
        }
        self.state = OrchestratorState::Idle;
        info!("scan finished");
        self.after_scan(out);
    }

    /// Open something, or give the fallback a turn and rescan.
    fn after_scan(&mut self, out: &mut Commands) {
        match self.open_next(out) {
            // Opened something, or a deferred close took the radio.
            Ok(()) | Err(Error::Busy(_)) => return,
            Err(_) => {}
        }
        if let Some(fallback) = self.fallback.as_mut() {
            debug!("nothing to open after scan, running fallback");
            let mut cx = FallbackContext {
                roster: &self.roster,
                out: &mut *out,
            };
            fallback.on_scan_idle(&mut cx);
        }
        if self.roster.all_remotes_found() {
            return;
        }
        if self.config.rescan_backoff_ms > 0 {
            emit(
                out,
                Command::Pause {
                    ms: self.config.rescan_backoff_ms,
                },
            );
        }
        if let Err(e) = self.start_scan(out) {
            error!("could not restart scan: {:?}", e);
        }
    }

    fn start_scan(&mut self, out: &mut Commands) -> Result<()> {
        match self.state {
            OrchestratorState::Scanning => return Ok(()),
            OrchestratorState::Opening(_) => return Err(Error::Busy(BusyReason::Opening)),
            OrchestratorState::Closing(_) => return Err(Error::Busy(BusyReason::Closing)),
            OrchestratorState::Idle => {}
        }
        if self.close_deferred(out) {
            return Err(Error::Busy(BusyReason::Closing));
        }
        if self.roster.all_remotes_found() {
            return Ok(());
        }
        emit(
            out,
            Command::StartScan {
                duration_secs: self.config.scan_duration_secs,
            },
        );
        self.state = OrchestratorState::Scanning;
        self.scan_stop_pending = false;
        debug!("scanning for {}s", self.config.scan_duration_secs);
        Ok(())
    }

    // - Scheduling ----------------------------------------------------------

    /// Open every remote once found, otherwise keep looking for the rest.
    fn reselect(&mut self, out: &mut Commands) {
        let result = if self.roster.all_remotes_found() {
            self.open_next(out)
        } else {
            self.start_scan(out)
        };
        if let Err(e) = result {
            debug!("reselect: {:?}", e);
        }
    }

    fn open_next(&mut self, out: &mut Commands) -> Result<()> {
        self.state.ensure_idle()?;
        if self.close_deferred(out) {
            return Err(Error::Busy(BusyReason::Closing));
        }
        let roster = &self.roster;
        let id = next_schedulable(self.cursor, roster.len(), |i| roster.is_schedulable(i))
            .ok_or(Error::NothingSchedulable)?;
        let (profile, remote) = roster.pair(id).ok_or(Error::NothingSchedulable)?;
        let (Some(gatt_if), Some(address)) = (profile.gatt_if(), remote.address()) else {
            return Err(Error::NothingSchedulable);
        };
        info!("opening profile {} ({})", id, remote.name());
        emit(out, Command::Open { gatt_if, address });
        self.cursor = Some(id);
        self.state = OrchestratorState::Opening(id);
        Ok(())
    }

    /// Issue the oldest deferred close whose link is still open. Returns
    /// `true` when it claimed the radio.
    fn close_deferred(&mut self, out: &mut Commands) -> bool {
        while !self.deferred.is_empty() {
            let id = self.deferred.remove(0);
            let Some(profile) = self.roster.profile(id) else {
                continue;
            };
            if issue_close(&mut self.state, profile, out).is_ok() {
                return true;
            }
        }
        false
    }

    // - Link setup ---------------------------------------------------------

    fn on_opened(
        &mut self,
        gatt_if: GattIf,
        status: GattStatus,
        conn_id: ConnId,
        out: &mut Commands,
    ) {
        let Some(id) = self.profile_for(gatt_if) else {
            return;
        };
        if self.state == OrchestratorState::Opening(id) {
            self.state = OrchestratorState::Idle;
        } else {
            warn!("open event for profile {} while {:?}", id, self.state);
        }
        if !status.is_ok() {
            error!("could not open profile {}: {:?}", id, status);
            if let Some(remote) = self.roster.remote_of_mut(id) {
                remote.mark_lost();
            }
            if let Err(e) = self.start_scan(out) {
                debug!("rescan after failed open: {:?}", e);
            }
            return;
        }
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        profile.mark_open(conn_id);
        debug!("profile {} open as connection {}", id, conn_id.0);
        emit(
            out,
            Command::ConfigureMtu {
                gatt_if,
                conn_id,
                mtu: self.config.mtu,
            },
        );
    }

    fn on_mtu_configured(
        &mut self,
        gatt_if: GattIf,
        status: GattStatus,
        mtu: u16,
        out: &mut Commands,
    ) {
        let Some(id) = self.profile_in_phase(gatt_if, LinkPhase::MtuNegotiate) else {
            return;
        };
        if !status.is_ok() || mtu != self.config.mtu {
            error!("profile {}: MTU negotiation failed ({:?}, mtu {})", id, status, mtu);
            self.close_profile(id, out);
            return;
        }
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        let Some(conn_id) = profile.conn_id() else {
            return;
        };
        profile.phase = LinkPhase::DiscoverService;
        debug!("profile {}: mtu {}", id, mtu);
        emit(
            out,
            Command::SearchService {
                gatt_if,
                conn_id,
                uuid: profile.service.uuid,
            },
        );
    }

    fn on_service_found(
        &mut self,
        gatt_if: GattIf,
        uuid: Uuid16,
        start_handle: u16,
        end_handle: u16,
    ) {
        let Some(id) = self.profile_in_phase(gatt_if, LinkPhase::DiscoverService) else {
            return;
        };
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        if uuid != profile.service.uuid {
            error!("profile {}: unexpected service {:04x}", id, uuid.0);
            return;
        }
        profile.service.found = true;
        profile.service.start_handle = start_handle;
        profile.service.end_handle = end_handle;
        info!("profile {}: service {:04x} found", id, uuid.0);
    }

    fn on_service_search_complete(
        &mut self,
        gatt_if: GattIf,
        status: GattStatus,
        out: &mut Commands,
    ) {
        let Some(id) = self.profile_in_phase(gatt_if, LinkPhase::DiscoverService) else {
            return;
        };
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        let Some(conn_id) = profile.conn_id() else {
            return;
        };
        if !status.is_ok() || !profile.service.found {
            error!("profile {}: service not available ({:?})", id, status);
            self.close_profile(id, out);
            return;
        }
        profile.phase = LinkPhase::DiscoverCharacteristic;
        emit(
            out,
            Command::ResolveCharacteristic {
                gatt_if,
                conn_id,
                start_handle: profile.service.start_handle,
                end_handle: profile.service.end_handle,
                uuid: profile.characteristic.uuid,
            },
        );
    }

    fn on_characteristics_resolved(
        &mut self,
        gatt_if: GattIf,
        lookup: CharLookup,
        out: &mut Commands,
    ) {
        let Some(id) = self.profile_in_phase(gatt_if, LinkPhase::DiscoverCharacteristic) else {
            return;
        };
        let CharLookup {
            status,
            total,
            matches,
            handle,
        } = lookup;
        if !status.is_ok() || total != 1 || matches != 1 {
            error!(
                "profile {}: characteristic lookup failed ({:?}, {} total, {} matching)",
                id, status, total, matches
            );
            self.close_profile(id, out);
            return;
        }
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        profile.characteristic.handle = Some(handle);
        profile.phase = LinkPhase::Ready;
        info!(
            "profile {}: char {:04x} at handle {}",
            id, profile.characteristic.uuid.0, handle
        );
        self.dispatch(id, ProfileEvent::DiscoveryComplete, out);
    }

    fn on_read_complete(
        &mut self,
        gatt_if: GattIf,
        status: GattStatus,
        value: &[u8],
        out: &mut Commands,
    ) {
        let Some(id) = self.profile_in_phase(gatt_if, LinkPhase::Ready) else {
            return;
        };
        self.dispatch(id, ProfileEvent::ReadComplete { status, value }, out);
    }

    // - Teardown -------------------------------------------------------------

    fn on_closed(&mut self, gatt_if: GattIf, out: &mut Commands) {
        let Some(id) = self.profile_for(gatt_if) else {
            return;
        };
        if self.state == OrchestratorState::Closing(id) {
            self.state = OrchestratorState::Idle;
        }
        debug!("profile {} closed", id);
        self.finish_close(id, out);
        self.reselect(out);
    }

    /// Forget the link and discovery results, then tell the handler.
    fn finish_close(&mut self, id: ProfileId, out: &mut Commands) {
        self.deferred.retain(|&d| d != id);
        let Some(profile) = self.roster.profile_mut(id) else {
            return;
        };
        let was_open = profile.is_open();
        profile.mark_closed();
        if was_open {
            self.dispatch(id, ProfileEvent::Closed, out);
        }
    }

    fn on_disconnected(&mut self, gatt_if: GattIf, reason: DisconnectReason, out: &mut Commands) {
        let Some(id) = self.profile_for(gatt_if) else {
            return;
        };
        let Some(remote) = self.roster.remote_of_mut(id) else {
            return;
        };
        // The stack broadcasts link loss to every profile; a remote that is
        // not found has nothing to tear down.
        if !remote.is_found() {
            trace!("profile {}: disconnect ignored, remote not found", id);
            return;
        }
        if !self.config.disconnect_policy.is_erroneous(reason) {
            debug!("profile {}: disconnected ({:?})", id, reason);
            return;
        }
        error!("profile {}: remote {} unreachable ({:?})", id, remote.name(), reason);
        remote.mark_lost();
        // The close event may never come for a link that failed mid-open.
        if matches!(
            self.state,
            OrchestratorState::Opening(_) | OrchestratorState::Closing(_)
        ) {
            self.state = OrchestratorState::Idle;
        }
        if let Err(e) = self.start_scan(out) {
            error!("could not start scan: {:?}", e);
        }
    }

    fn on_command_failed(&mut self, cmd: Command, out: &mut Commands) -> Result<()> {
        warn!("radio refused {:?}", cmd);
        match cmd {
            Command::SetScanParams(_) => return Err(Error::ScanParamsRejected),
            Command::RegisterApp { app_id } => return Err(Error::RegistrationFailed(app_id)),
            Command::StartScan { .. } => {
                if self.state == OrchestratorState::Scanning {
                    self.state = OrchestratorState::Idle;
                }
                self.scan_stop_pending = false;
                match self.open_next(out) {
                    Ok(()) | Err(Error::Busy(_)) => {}
                    Err(_) => {
                        emit(
                            out,
                            Command::Pause {
                                ms: self.config.scan_retry_ms,
                            },
                        );
                        if let Err(e) = self.start_scan(out) {
                            debug!("scan retry: {:?}", e);
                        }
                    }
                }
            }
            // The scan still ends on its own.
            Command::StopScan => self.scan_stop_pending = false,
            Command::Open { gatt_if, .. } => {
                let Some(id) = self.roster.find_by_if(gatt_if) else {
                    return Ok(());
                };
                if self.state == OrchestratorState::Opening(id) {
                    self.state = OrchestratorState::Idle;
                }
                self.lose_and_rescan(id, out);
            }
            Command::Close { gatt_if, .. } => {
                let Some(id) = self.roster.find_by_if(gatt_if) else {
                    return Ok(());
                };
                if self.state == OrchestratorState::Closing(id) {
                    self.state = OrchestratorState::Idle;
                }
                self.finish_close(id, out);
                self.lose_and_rescan(id, out);
            }
            Command::ConfigureMtu { gatt_if, .. }
            | Command::SearchService { gatt_if, .. }
            | Command::ResolveCharacteristic { gatt_if, .. }
            | Command::ReadCharacteristic { gatt_if, .. } => {
                if let Some(id) = self.roster.find_by_if(gatt_if) {
                    self.close_profile(id, out);
                }
            }
            Command::Pause { .. } | Command::ServeRequests { .. } => {}
        }
        Ok(())
    }

    // - Helpers -------------------------------------------------------------

    fn lose_and_rescan(&mut self, id: ProfileId, out: &mut Commands) {
        if let Some(remote) = self.roster.remote_of_mut(id) {
            remote.mark_lost();
        }
        if let Err(e) = self.start_scan(out) {
            debug!("rescan: {:?}", e);
        }
    }

    fn close_profile(&mut self, id: ProfileId, out: &mut Commands) {
        let Some(profile) = self.roster.profile(id) else {
            return;
        };
        if let Err(e) = close_or_defer(&mut self.state, &mut self.deferred, profile, out) {
            error!("could not close profile {}: {:?}", id, e);
        }
    }

    fn profile_for(&self, gatt_if: GattIf) -> Option<ProfileId> {
        let id = self.roster.find_by_if(gatt_if);
        if id.is_none() {
            debug!("event for unknown interface {}", gatt_if.0);
        }
        id
    }

    /// Profile for `gatt_if`, if its link is open and in `phase`. Stale
    /// events from an earlier connection are dropped here.
    fn profile_in_phase(&self, gatt_if: GattIf, phase: LinkPhase) -> Option<ProfileId> {
        let id = self.profile_for(gatt_if)?;
        let profile = self.roster.profile(id)?;
        if profile.is_open() && profile.phase() == phase {
            Some(id)
        } else {
            debug!(
                "profile {}: stale event in {:?}, expected {:?}",
                id,
                profile.phase(),
                phase
            );
            None
        }
    }

    fn dispatch(&mut self, id: ProfileId, event: ProfileEvent<'_>, out: &mut Commands) {
        let Self {
            roster,
            handler,
            state,
            deferred,
            ..
        } = self;
        let Some((profile, remote)) = roster.pair(id) else {
            return;
        };
        let mut cx = ProfileContext {
            roster,
            profile,
            remote,
            state,
            deferred,
            out,
        };
        handler.on_profile_event(event, &mut cx);
    }
}
