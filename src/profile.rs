//! Profiles, devices, and filtering groups.
//!
//! A profile is the dynamic per-customer record: custom filtering rules and
//! feature overrides. A device is one installation under a profile. Both are
//! looked up per query by a [`ProfileDb`], by device ID or by linked IP, and
//! the references are held only for the duration of that query.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::deviceid::DeviceId;

/// The ID of a profile.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub String);

/// The ID of a filtering group.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct FilteringGroupId(pub String);

/// The ID of a filter rule list.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize)]
#[serde(transparent)]
pub struct FilterListId(pub String);

/// The ID of a blocked service, e.g. `"tiktok"`.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize)]
#[serde(transparent)]
pub struct BlockedServiceId(pub String);

/// A single client installation under a profile.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// When false, every query from this device is passed through untouched.
    pub filtering_enabled: bool,
}

/// The dynamic per-customer record.
#[derive(Clone, Debug)]
pub struct Profile {
    pub id: ProfileId,
    /// Custom rules in the same syntax as rule lists; evaluated before any
    /// group list, with `@@` exceptions winning ties.
    pub custom_rules: Vec<String>,
    /// Per-profile overrides of the group's parental-control flags, if set.
    pub block_adult: Option<bool>,
    pub general_safe_search: Option<bool>,
    pub youtube_safe_search: Option<bool>,
    /// IDs of blocked services selected by the customer.
    pub blocked_services: Vec<BlockedServiceId>,
}

/// Static bundle of rule lists and feature flags selected by a server group.
#[derive(Clone, Debug, Deserialize)]
pub struct FilteringGroup {
    pub id: FilteringGroupId,
    /// Rule lists to apply, in order.
    #[serde(default)]
    pub rule_lists: Vec<FilterListId>,
    #[serde(default)]
    pub block_adult: bool,
    #[serde(default)]
    pub general_safe_search: bool,
    #[serde(default)]
    pub youtube_safe_search: bool,
    #[serde(default)]
    pub safe_browsing: bool,
    #[serde(default)]
    pub block_private_relay: bool,
}

/// Looks up profiles and devices. The real backend is an external service;
/// the data plane only depends on this interface.
pub trait ProfileDb: Send + Sync {
    /// Resolves a device ID to its device and owning profile.
    fn by_device_id(&self, id: &DeviceId) -> Option<(Arc<Profile>, Arc<Device>)>;

    /// Resolves a linked IP to its device and owning profile.
    fn by_linked_ip(&self, addr: IpAddr) -> Option<(Arc<Profile>, Arc<Device>)>;
}

/// An in-memory profile database, used in tests and standalone runs.
#[derive(Default)]
pub struct InMemoryProfileDb {
    by_device: HashMap<DeviceId, (Arc<Profile>, Arc<Device>)>,
    by_ip: HashMap<IpAddr, (Arc<Profile>, Arc<Device>)>,
}

impl InMemoryProfileDb {
    pub fn insert(&mut self, profile: Profile, device: Device, linked_ip: Option<IpAddr>) {
        let profile = Arc::new(profile);
        let device = Arc::new(device);
        if let Some(ip) = linked_ip {
            self.by_ip.insert(ip, (Arc::clone(&profile), Arc::clone(&device)));
        }

        self.by_device.insert(device.id.clone(), (profile, device));
    }
}

impl ProfileDb for InMemoryProfileDb {
    fn by_device_id(&self, id: &DeviceId) -> Option<(Arc<Profile>, Arc<Device>)> {
        self.by_device.get(id).cloned()
    }

    fn by_linked_ip(&self, addr: IpAddr) -> Option<(Arc<Profile>, Arc<Device>)> {
        self.by_ip.get(&addr).cloned()
    }
}
