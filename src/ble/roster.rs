//! The fixed profile roster and round-robin scheduling over it.

use heapless::Vec;

use crate::ble::profile::ConnectionProfile;
use crate::ble::registry::{RemoteDevice, RemoteId};
use crate::ble::{GattIf, ProfileId, Uuid16};
use crate::config::MAX_PROFILES;
use crate::error::{Error, Result};

/// Ordered, fixed-size set of profiles and the remotes they target.
///
/// Built once at start; the orchestrator owns it afterwards.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    remotes: Vec<RemoteDevice, MAX_PROFILES>,
    profiles: Vec<ConnectionProfile, MAX_PROFILES>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peripheral and the profile that polls it.
    pub fn add(
        &mut self,
        name: &str,
        service: Uuid16,
        characteristic: Uuid16,
    ) -> Result<ProfileId> {
        if self.profiles.is_full() {
            return Err(Error::RosterFull);
        }
        let remote = RemoteDevice::new(name)?;
        let id = self.profiles.len();
        let remote_id = RemoteId(self.remotes.len());
        self.remotes.push(remote).map_err(|_| Error::RosterFull)?;
        self.profiles
            .push(ConnectionProfile::new(id, remote_id, service, characteristic))
            .map_err(|_| Error::RosterFull)?;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn profile(&self, id: ProfileId) -> Option<&ConnectionProfile> {
        self.profiles.get(id)
    }

    pub(crate) fn profile_mut(&mut self, id: ProfileId) -> Option<&mut ConnectionProfile> {
        self.profiles.get_mut(id)
    }

    pub fn remote(&self, id: RemoteId) -> Option<&RemoteDevice> {
        self.remotes.get(id.0)
    }

    /// The remote a profile is bound to.
    pub fn remote_of(&self, id: ProfileId) -> Option<&RemoteDevice> {
        self.profile(id).and_then(|p| self.remote(p.remote()))
    }

    pub(crate) fn remote_of_mut(&mut self, id: ProfileId) -> Option<&mut RemoteDevice> {
        let remote = self.profile(id)?.remote();
        self.remotes.get_mut(remote.0)
    }

    /// Profile and remote together, for handler dispatch.
    pub(crate) fn pair(&self, id: ProfileId) -> Option<(&ConnectionProfile, &RemoteDevice)> {
        let profile = self.profile(id)?;
        let remote = self.remote(profile.remote())?;
        Some((profile, remote))
    }

    pub(crate) fn remote_by_name_mut(&mut self, name: &str) -> Option<&mut RemoteDevice> {
        self.remotes.iter_mut().find(|r| r.name() == name)
    }

    pub fn find_by_if(&self, gatt_if: GattIf) -> Option<ProfileId> {
        self.profiles
            .iter()
            .position(|p| p.gatt_if() == Some(gatt_if))
    }

    pub fn all_remotes_found(&self) -> bool {
        self.remotes.iter().all(|r| r.is_found())
    }

    /// A profile can be opened when it is registered, its remote has been
    /// found and it has no link open already.
    pub fn is_schedulable(&self, id: ProfileId) -> bool {
        match self.pair(id) {
            Some((profile, remote)) => {
                remote.is_found() && profile.is_registered() && !profile.is_open()
            }
            None => false,
        }
    }
}

/// Pick the next index after `cursor` (wrapping) that satisfies `eligible`.
///
/// With no cursor yet, the search starts at index 0. The cursor itself is
/// visited last, so a lone eligible profile is picked again.
pub fn next_schedulable(
    cursor: Option<usize>,
    len: usize,
    mut eligible: impl FnMut(usize) -> bool,
) -> Option<usize> {
    let start = cursor.map_or(0, |c| c + 1).min(len);
    (start..len).chain(0..start).find(|&i| eligible(i))
}
