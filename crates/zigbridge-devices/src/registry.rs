//! Device Registry - in-memory index of known devices, their endpoints and
//! active cluster bindings.
//!
//! The Gateway Adapter owns the [`DeviceRegistry`] and is its only writer.
//! Every other component reads through a [`RegistryView`], which exposes the
//! lookups and nothing else. Lookups return cloned snapshots, so a reader
//! never holds the lock across a Device Network call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use zigbridge_core::{Capability, ClusterKind, EndpointDescriptor, Ieee, NodeDescriptor, Nwk, ZDO_ENDPOINT};

use crate::network::DeviceInfo;

/// Error type for registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Device not found: {0}")]
    NotFound(Ieee),

    #[error("Device unavailable: {0}")]
    Unavailable(Ieee),

    #[error("Endpoint {0} is reserved for network management")]
    ReservedEndpoint(u8),

    #[error("Device {ieee} has no endpoint {endpoint}")]
    UnknownEndpoint { ieee: Ieee, endpoint: u8 },

    #[error("Endpoint {endpoint} of {ieee} does not serve cluster {cluster}")]
    ClusterNotServed {
        ieee: Ieee,
        endpoint: u8,
        cluster: ClusterKind,
    },
}

/// (endpoint, cluster kind) pair with reporting configured and reports forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterBinding {
    pub endpoint: u8,
    pub cluster: ClusterKind,
}

/// A device as known to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub ieee: Ieee,
    pub nwk: Nwk,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub is_coordinator: bool,
    pub available: bool,
    pub node: Option<NodeDescriptor>,
    /// Bridgeable endpoints; endpoint 0 is never stored.
    pub endpoints: BTreeMap<u8, EndpointDescriptor>,
    pub capabilities: BTreeSet<Capability>,
    bindings: BTreeSet<ClusterBinding>,
}

impl DeviceRecord {
    fn from_info(info: &DeviceInfo) -> Self {
        let mut record = Self {
            ieee: info.ieee,
            nwk: info.nwk,
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            is_coordinator: info.is_coordinator,
            available: info.available,
            node: info.node,
            endpoints: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            bindings: BTreeSet::new(),
        };
        record.replace_endpoints(&info.endpoints);
        record
    }

    /// Replace the endpoint set. Capabilities are recomputed only when the
    /// membership actually changed. Returns whether it changed.
    fn replace_endpoints(&mut self, endpoints: &[EndpointDescriptor]) -> bool {
        let endpoints: BTreeMap<u8, EndpointDescriptor> = endpoints
            .iter()
            .filter(|ep| ep.id != ZDO_ENDPOINT)
            .map(|ep| (ep.id, ep.clone()))
            .collect();
        if endpoints == self.endpoints {
            return false;
        }
        self.endpoints = endpoints;
        self.capabilities = self
            .endpoints
            .values()
            .flat_map(|ep| Capability::derive(&ep.in_clusters))
            .collect();
        // Bindings on endpoints or clusters that disappeared are stale.
        let endpoints = &self.endpoints;
        self.bindings.retain(|b| {
            endpoints
                .get(&b.endpoint)
                .is_some_and(|ep| ep.in_clusters.contains(&b.cluster.id()))
        });
        true
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Every (endpoint, cluster) the device could be bound on.
    pub fn bindable_clusters(&self) -> Vec<ClusterBinding> {
        let mut seen = BTreeSet::new();
        self.endpoints
            .values()
            .flat_map(|ep| {
                ep.supported_clusters().map(move |cluster| ClusterBinding {
                    endpoint: ep.id,
                    cluster,
                })
            })
            .filter(|binding| seen.insert(*binding))
            .collect()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ClusterBinding> {
        self.bindings.iter()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_bound(&self, endpoint: u8, cluster: ClusterKind) -> bool {
        self.bindings.contains(&ClusterBinding { endpoint, cluster })
    }

    /// Lowest-numbered endpoint with an active binding for `cluster`.
    pub fn binding_for(&self, cluster: ClusterKind) -> Option<ClusterBinding> {
        self.bindings.iter().find(|b| b.cluster == cluster).copied()
    }
}

/// Registry of known devices, keyed by IEEE address.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<Ieee, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a device or refresh an existing entry (rejoin).
    ///
    /// Returns `true` when the device was not known before. Existing
    /// bindings survive a refresh unless their endpoint or cluster went away.
    pub async fn upsert_device(&self, info: &DeviceInfo) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&info.ieee) {
            Some(record) => {
                record.nwk = info.nwk;
                if info.manufacturer.is_some() {
                    record.manufacturer = info.manufacturer.clone();
                }
                if info.model.is_some() {
                    record.model = info.model.clone();
                }
                if info.node.is_some() {
                    record.node = info.node;
                }
                record.is_coordinator = info.is_coordinator;
                if !info.endpoints.is_empty() {
                    record.replace_endpoints(&info.endpoints);
                }
                if record.available != info.available {
                    record.available = info.available;
                    if !info.available {
                        record.bindings.clear();
                    }
                }
                false
            }
            None => {
                devices.insert(info.ieee, DeviceRecord::from_info(info));
                true
            }
        }
    }

    pub async fn remove_device(&self, ieee: &Ieee) -> Option<DeviceRecord> {
        self.devices.write().await.remove(ieee)
    }

    /// Replace a device's endpoints. Returns whether membership changed.
    pub async fn set_endpoints(
        &self,
        ieee: &Ieee,
        endpoints: &[EndpointDescriptor],
    ) -> Result<bool, RegistryError> {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(ieee).ok_or(RegistryError::NotFound(*ieee))?;
        Ok(record.replace_endpoints(endpoints))
    }

    /// Record a binding. Idempotent: returns `false` if it already existed.
    pub async fn bind_cluster(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster: ClusterKind,
    ) -> Result<bool, RegistryError> {
        if endpoint == ZDO_ENDPOINT {
            return Err(RegistryError::ReservedEndpoint(endpoint));
        }
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(ieee).ok_or(RegistryError::NotFound(*ieee))?;
        if !record.available {
            return Err(RegistryError::Unavailable(*ieee));
        }
        let descriptor = record
            .endpoints
            .get(&endpoint)
            .ok_or(RegistryError::UnknownEndpoint {
                ieee: *ieee,
                endpoint,
            })?;
        if !descriptor.in_clusters.contains(&cluster.id()) {
            return Err(RegistryError::ClusterNotServed {
                ieee: *ieee,
                endpoint,
                cluster,
            });
        }
        Ok(record.bindings.insert(ClusterBinding { endpoint, cluster }))
    }

    /// Update availability. Going unavailable drops every binding.
    ///
    /// Returns whether the flag changed.
    pub async fn set_availability(&self, ieee: &Ieee, available: bool) -> Result<bool, RegistryError> {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(ieee).ok_or(RegistryError::NotFound(*ieee))?;
        if record.available == available {
            return Ok(false);
        }
        record.available = available;
        if !available {
            record.bindings.clear();
        }
        Ok(true)
    }

    pub async fn lookup_by_address(&self, ieee: &Ieee) -> Option<DeviceRecord> {
        self.devices.read().await.get(ieee).cloned()
    }

    pub async fn list_by_capability(&self, capability: Capability) -> Vec<DeviceRecord> {
        let mut found: Vec<DeviceRecord> = self
            .devices
            .read()
            .await
            .values()
            .filter(|record| record.has_capability(capability))
            .cloned()
            .collect();
        found.sort_by_key(|record| record.ieee);
        found
    }

    /// All devices, ordered by address.
    pub async fn list(&self) -> Vec<DeviceRecord> {
        let mut all: Vec<DeviceRecord> = self.devices.read().await.values().cloned().collect();
        all.sort_by_key(|record| record.ieee);
        all
    }

    /// Snapshot of every known address, ordered.
    pub async fn addresses(&self) -> Vec<Ieee> {
        let mut addresses: Vec<Ieee> = self.devices.read().await.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only handle on the registry.
#[derive(Clone)]
pub struct RegistryView {
    inner: Arc<DeviceRegistry>,
}

impl RegistryView {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { inner: registry }
    }

    pub async fn lookup_by_address(&self, ieee: &Ieee) -> Option<DeviceRecord> {
        self.inner.lookup_by_address(ieee).await
    }

    pub async fn list_by_capability(&self, capability: Capability) -> Vec<DeviceRecord> {
        self.inner.list_by_capability(capability).await
    }

    pub async fn list(&self) -> Vec<DeviceRecord> {
        self.inner.list().await
    }

    pub async fn addresses(&self) -> Vec<Ieee> {
        self.inner.addresses().await
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulb(ieee: u64) -> DeviceInfo {
        DeviceInfo::new(Ieee::from_u64(ieee), Nwk(0x1000 + ieee as u16))
            .with_model("bulb")
            .with_endpoints(vec![
                EndpointDescriptor::new(0, vec![0x0000]),
                EndpointDescriptor::new(1, vec![0x0000, 0x0006, 0x0008, 0x0300]),
            ])
    }

    #[tokio::test]
    async fn test_upsert_never_duplicates() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert_device(&bulb(1)).await);
        let mut rejoin = bulb(1);
        rejoin.nwk = Nwk(0x9999);
        assert!(!registry.upsert_device(&rejoin).await);

        assert_eq!(registry.len().await, 1);
        let record = registry.lookup_by_address(&Ieee::from_u64(1)).await.unwrap();
        assert_eq!(record.nwk, Nwk(0x9999));
        assert_eq!(record.model.as_deref(), Some("bulb"));
    }

    #[tokio::test]
    async fn test_zdo_endpoint_not_stored() {
        let registry = DeviceRegistry::new();
        registry.upsert_device(&bulb(1)).await;
        let record = registry.lookup_by_address(&Ieee::from_u64(1)).await.unwrap();
        assert_eq!(record.endpoints.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(record.bindable_clusters().len(), 3);
        assert!(record.has_capability(Capability::Light));
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let registry = DeviceRegistry::new();
        let ieee = Ieee::from_u64(1);
        registry.upsert_device(&bulb(1)).await;

        assert!(registry.bind_cluster(&ieee, 1, ClusterKind::OnOff).await.unwrap());
        assert!(!registry.bind_cluster(&ieee, 1, ClusterKind::OnOff).await.unwrap());

        let record = registry.lookup_by_address(&ieee).await.unwrap();
        assert_eq!(record.binding_count(), 1);
        assert_eq!(
            record.binding_for(ClusterKind::OnOff),
            Some(ClusterBinding {
                endpoint: 1,
                cluster: ClusterKind::OnOff
            })
        );
    }

    #[tokio::test]
    async fn test_bind_rejections() {
        let registry = DeviceRegistry::new();
        let ieee = Ieee::from_u64(1);
        registry.upsert_device(&bulb(1)).await;

        assert_eq!(
            registry.bind_cluster(&ieee, 0, ClusterKind::OnOff).await,
            Err(RegistryError::ReservedEndpoint(0))
        );
        assert!(matches!(
            registry.bind_cluster(&ieee, 2, ClusterKind::OnOff).await,
            Err(RegistryError::UnknownEndpoint { .. })
        ));
        assert!(matches!(
            registry.bind_cluster(&ieee, 1, ClusterKind::IasZone).await,
            Err(RegistryError::ClusterNotServed { .. })
        ));
        assert_eq!(
            registry
                .bind_cluster(&Ieee::from_u64(2), 1, ClusterKind::OnOff)
                .await,
            Err(RegistryError::NotFound(Ieee::from_u64(2)))
        );
    }

    #[tokio::test]
    async fn test_unavailable_drops_bindings_but_stays_lookupable() {
        let registry = DeviceRegistry::new();
        let ieee = Ieee::from_u64(1);
        registry.upsert_device(&bulb(1)).await;
        registry.bind_cluster(&ieee, 1, ClusterKind::OnOff).await.unwrap();

        assert!(registry.set_availability(&ieee, false).await.unwrap());
        assert!(!registry.set_availability(&ieee, false).await.unwrap());

        let record = registry.lookup_by_address(&ieee).await.unwrap();
        assert!(!record.available);
        assert_eq!(record.binding_count(), 0);
        assert_eq!(
            registry.bind_cluster(&ieee, 1, ClusterKind::OnOff).await,
            Err(RegistryError::Unavailable(ieee))
        );
    }

    #[tokio::test]
    async fn test_capabilities_follow_endpoint_changes() {
        let registry = DeviceRegistry::new();
        let ieee = Ieee::from_u64(1);
        registry.upsert_device(&bulb(1)).await;
        registry.bind_cluster(&ieee, 1, ClusterKind::ColorControl).await.unwrap();

        let same = vec![EndpointDescriptor::new(1, vec![0x0000, 0x0006, 0x0008, 0x0300])];
        assert!(!registry.set_endpoints(&ieee, &same).await.unwrap());

        let dimmer = vec![EndpointDescriptor::new(1, vec![0x0006, 0x0008])];
        assert!(registry.set_endpoints(&ieee, &dimmer).await.unwrap());

        let record = registry.lookup_by_address(&ieee).await.unwrap();
        assert!(!record.has_capability(Capability::Color));
        assert!(record.has_capability(Capability::Light));
        assert!(!record.is_bound(1, ClusterKind::ColorControl));
    }

    #[tokio::test]
    async fn test_list_by_capability_and_view() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.upsert_device(&bulb(2)).await;
        registry.upsert_device(&bulb(1)).await;
        registry
            .upsert_device(
                &DeviceInfo::new(Ieee::from_u64(3), Nwk(3))
                    .with_endpoints(vec![EndpointDescriptor::new(1, vec![0x0402])]),
            )
            .await;

        let view = RegistryView::new(registry.clone());
        let lights: Vec<Ieee> = view
            .list_by_capability(Capability::Light)
            .await
            .into_iter()
            .map(|r| r.ieee)
            .collect();
        assert_eq!(lights, vec![Ieee::from_u64(1), Ieee::from_u64(2)]);
        assert_eq!(view.addresses().await.len(), 3);

        registry.remove_device(&Ieee::from_u64(3)).await;
        assert!(view.lookup_by_address(&Ieee::from_u64(3)).await.is_none());
        assert_eq!(view.len().await, 2);
    }
}
