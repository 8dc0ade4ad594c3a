//! Connection profiles: one orchestrated connection slot per peripheral.

use crate::ble::registry::RemoteId;
use crate::ble::{ConnId, GattIf, ProfileId, Uuid16};

/// Target primary service and what discovery learned about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceTarget {
    pub uuid: Uuid16,
    pub found: bool,
    pub start_handle: u16,
    pub end_handle: u16,
}

impl ServiceTarget {
    pub const fn new(uuid: Uuid16) -> Self {
        Self {
            uuid,
            found: false,
            start_handle: 0,
            end_handle: 0,
        }
    }
}

/// Target characteristic inside [`ServiceTarget`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharTarget {
    pub uuid: Uuid16,
    /// Value handle; `None` until discovered.
    pub handle: Option<u16>,
}

impl CharTarget {
    pub const fn new(uuid: Uuid16) -> Self {
        Self { uuid, handle: None }
    }

    pub fn found(&self) -> bool {
        self.handle.is_some()
    }
}

/// Progress of an open link through negotiation and discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkPhase {
    Closed,
    MtuNegotiate,
    DiscoverService,
    DiscoverCharacteristic,
    /// Discovery done; the handler owns the link until it closes it.
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProfile {
    id: ProfileId,
    remote: RemoteId,
    /// Assigned once, at registration.
    pub(crate) gatt_if: Option<GattIf>,
    /// `None` while the link is closed.
    pub(crate) conn_id: Option<ConnId>,
    pub(crate) phase: LinkPhase,
    pub(crate) service: ServiceTarget,
    pub(crate) characteristic: CharTarget,
}

impl ConnectionProfile {
    pub fn new(id: ProfileId, remote: RemoteId, service: Uuid16, characteristic: Uuid16) -> Self {
        Self {
            id,
            remote,
            gatt_if: None,
            conn_id: None,
            phase: LinkPhase::Closed,
            service: ServiceTarget::new(service),
            characteristic: CharTarget::new(characteristic),
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn remote(&self) -> RemoteId {
        self.remote
    }

    pub fn gatt_if(&self) -> Option<GattIf> {
        self.gatt_if
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.conn_id
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn service(&self) -> &ServiceTarget {
        &self.service
    }

    pub fn characteristic(&self) -> &CharTarget {
        &self.characteristic
    }

    pub fn is_registered(&self) -> bool {
        self.gatt_if.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.conn_id.is_some()
    }

    pub(crate) fn mark_open(&mut self, conn_id: ConnId) {
        self.conn_id = Some(conn_id);
        self.phase = LinkPhase::MtuNegotiate;
    }

    /// Handles are not stable across reconnects, so every close forgets them.
    pub(crate) fn mark_closed(&mut self) {
        self.conn_id = None;
        self.phase = LinkPhase::Closed;
        self.service = ServiceTarget::new(self.service.uuid);
        self.characteristic = CharTarget::new(self.characteristic.uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new(2, RemoteId(2), Uuid16(0x00FF), Uuid16(0xFF01))
    }

    #[test]
    fn new_profile_is_closed_and_unregistered() {
        let p = profile();
        assert_eq!(p.id(), 2);
        assert!(!p.is_registered());
        assert!(!p.is_open());
        assert_eq!(p.phase(), LinkPhase::Closed);
        assert!(!p.service().found);
        assert!(!p.characteristic().found());
    }

    #[test]
    fn close_invalidates_discovery() {
        let mut p = profile();
        p.mark_open(ConnId(7));
        p.service.found = true;
        p.service.start_handle = 0x28;
        p.service.end_handle = 0x2F;
        p.characteristic.handle = Some(0x2A);
        p.phase = LinkPhase::Ready;

        p.mark_closed();

        assert_eq!(p.conn_id(), None);
        assert_eq!(p.phase(), LinkPhase::Closed);
        assert_eq!(*p.service(), ServiceTarget::new(Uuid16(0x00FF)));
        assert_eq!(p.characteristic().handle, None);
        assert_eq!(p.characteristic().uuid, Uuid16(0xFF01));
    }
}
