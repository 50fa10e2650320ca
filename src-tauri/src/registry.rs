//! In-memory directory of devices learned via discovery.
//!
//! Three maps live behind one lock (the service wraps the registry in a
//! mutex): the device table keyed by device id, the reverse index from
//! advertised fullname to device id, and the consecutive-probe-failure
//! counters. Keeping them together makes announce/evict atomic, so a
//! re-announcement can never race an eviction based on a stale count.

use std::collections::HashMap;

use crate::device::{now_secs, DiscoveredDevice};
use crate::identity;

/// Consecutive probe failures before a device is evicted.
pub const MAX_PROBE_FAILURES: u32 = 3;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DiscoveredDevice>,
    fullname_to_id: HashMap<String, String>,
    failures: HashMap<String, u32>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a device seen in a discovery announcement. A re-announcement is
    /// evidence of liveness, so any pending failure count is cleared.
    pub fn announce(&mut self, fullname: &str, mut device: DiscoveredDevice) {
        device.last_seen = now_secs();
        if let Some(existing) = self.devices.get(&device.device_id) {
            device.discovered_at = existing.discovered_at;
        }
        self.failures.remove(&device.device_id);
        self.fullname_to_id
            .insert(fullname.to_string(), device.device_id.clone());
        self.devices.insert(device.device_id.clone(), device);
    }

    /// Handle an explicit "service removed" notice. Primary path resolves the
    /// fullname through the reverse index. If the mapping is missing (state
    /// lost across a restart), fall back to matching the leading label segment
    /// against device-id prefixes. The fallback is approximate: distinct ids
    /// sharing the first 15 characters would collide.
    pub fn service_removed(&mut self, fullname: &str) -> Vec<String> {
        if let Some(device_id) = self.fullname_to_id.remove(fullname) {
            self.devices.remove(&device_id);
            self.failures.remove(&device_id);
            return vec![device_id];
        }

        // Fallback: prefix match on the advertised label
        let label = identity::label_of_fullname(fullname);
        let matched: Vec<String> = self
            .devices
            .keys()
            .filter(|id| id.starts_with(label))
            .cloned()
            .collect();
        for id in &matched {
            self.remove_device(id);
        }
        matched
    }

    /// Remove a device and every trace of it: registry entry, reverse
    /// mapping, failure counter.
    pub fn remove_device(&mut self, device_id: &str) -> Option<DiscoveredDevice> {
        let removed = self.devices.remove(device_id);
        self.failures.remove(device_id);
        self.fullname_to_id.retain(|_, id| id != device_id);
        removed
    }

    /// Record one probe failure. Returns the evicted device when the count
    /// reaches the threshold.
    pub fn record_failure(&mut self, device_id: &str) -> Option<DiscoveredDevice> {
        if !self.devices.contains_key(device_id) {
            // Device vanished between snapshot and probe result
            self.failures.remove(device_id);
            return None;
        }
        let count = self.failures.entry(device_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= MAX_PROBE_FAILURES {
            self.remove_device(device_id)
        } else {
            None
        }
    }

    /// A successful probe resets the counter to absent.
    pub fn clear_failures(&mut self, device_id: &str) {
        self.failures.remove(device_id);
    }

    pub fn get(&self, device_id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(device_id)
    }

    pub fn list(&self) -> Vec<DiscoveredDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn failure_count(&self, device_id: &str) -> u32 {
        self.failures.get(device_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            device_id: id.to_string(),
            device_name: "test-host".to_string(),
            user_id: "user-1".to_string(),
            user_nickname: "Alice".to_string(),
            ip_address: "192.168.1.10".parse().unwrap(),
            port: 4400,
            discovered_at: now_secs(),
            last_seen: 0,
        }
    }

    fn fullname(id: &str) -> String {
        identity::advertised_name(identity::label(id))
    }

    const ID_A: &str = "aaaaaaaaaaaaaaaa0000000000000000";
    const ID_B: &str = "bbbbbbbbbbbbbbbb0000000000000000";

    #[test]
    fn announce_then_list() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.list().is_empty());
        reg.announce(&fullname(ID_A), device(ID_A));
        let listed = reg.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].device_id, ID_A);
        assert!(listed[0].last_seen > 0);
    }

    #[test]
    fn reannounce_refreshes_and_keeps_discovered_at() {
        let mut reg = DeviceRegistry::new();
        reg.announce(&fullname(ID_A), device(ID_A));
        let first_discovered = reg.get(ID_A).unwrap().discovered_at;
        reg.record_failure(ID_A);
        assert_eq!(reg.failure_count(ID_A), 1);

        reg.announce(&fullname(ID_A), device(ID_A));
        assert_eq!(reg.failure_count(ID_A), 0);
        assert_eq!(reg.get(ID_A).unwrap().discovered_at, first_discovered);
    }

    #[test]
    fn removal_uses_mapping_and_never_hits_prefix_siblings() {
        // Two ids sharing a 15-char prefix but advertised under distinct
        // fullname mappings: removal through the map touches exactly one.
        let id_x = "ccccccccccccccc1000000000000000x";
        let id_y = "ccccccccccccccc2000000000000000y";
        let mut reg = DeviceRegistry::new();
        reg.announce("instance-x._landrop._udp.local.", device(id_x));
        reg.announce("instance-y._landrop._udp.local.", device(id_y));

        let removed = reg.service_removed("instance-x._landrop._udp.local.");
        assert_eq!(removed, vec![id_x.to_string()]);
        assert!(reg.get(id_x).is_none());
        assert!(reg.get(id_y).is_some());
    }

    #[test]
    fn removal_falls_back_to_label_prefix() {
        let mut reg = DeviceRegistry::new();
        reg.announce(&fullname(ID_A), device(ID_A));
        reg.announce(&fullname(ID_B), device(ID_B));

        // A fullname we never mapped, as after a restart lost the index:
        // the label prefix still finds the right device
        let unknown = format!("{}.{}", identity::label(ID_A), "_other._udp.local.");
        let removed = reg.service_removed(&unknown);
        assert_eq!(removed, vec![ID_A.to_string()]);
        assert!(reg.get(ID_A).is_none());
        assert!(reg.get(ID_B).is_some());
    }

    #[test]
    fn removal_clears_failure_counter_too() {
        let mut reg = DeviceRegistry::new();
        reg.announce(&fullname(ID_A), device(ID_A));
        reg.record_failure(ID_A);
        reg.service_removed(&fullname(ID_A));
        assert_eq!(reg.failure_count(ID_A), 0);
        assert!(reg.get(ID_A).is_none());
    }

    #[test]
    fn three_failures_evict() {
        let mut reg = DeviceRegistry::new();
        reg.announce(&fullname(ID_A), device(ID_A));
        assert!(reg.record_failure(ID_A).is_none());
        assert!(reg.record_failure(ID_A).is_none());
        let evicted = reg.record_failure(ID_A);
        assert_eq!(evicted.unwrap().device_id, ID_A);
        assert!(reg.get(ID_A).is_none());
        assert_eq!(reg.failure_count(ID_A), 0);
    }

    #[test]
    fn success_resets_counter_so_next_failure_counts_from_one() {
        let mut reg = DeviceRegistry::new();
        reg.announce(&fullname(ID_A), device(ID_A));
        reg.record_failure(ID_A);
        reg.record_failure(ID_A);
        reg.clear_failures(ID_A);
        // Fourth failure overall, but first since the success
        assert!(reg.record_failure(ID_A).is_none());
        assert_eq!(reg.failure_count(ID_A), 1);
        assert!(reg.get(ID_A).is_some());
    }

    #[test]
    fn failure_for_unknown_device_is_ignored() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.record_failure(ID_A).is_none());
        assert_eq!(reg.failure_count(ID_A), 0);
    }
}
