//! Periodic Refresher.
//!
//! Re-reads the state of every bound cluster on a jittered interval so that
//! missed attribute reports are eventually corrected. Read answers come back
//! as ordinary attribute events through the Gateway Adapter.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zigbridge_core::TimingConfig;

use crate::codec::cluster_spec;
use crate::network::{NetworkError, NetworkHandle};
use crate::registry::RegistryView;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub devices: usize,
    pub attempted: usize,
    pub failed: usize,
}

pub struct PeriodicRefresher {
    registry: RegistryView,
    network: NetworkHandle,
    min_interval: Duration,
    max_interval: Duration,
    read_timeout: Duration,
}

impl PeriodicRefresher {
    pub fn new(registry: RegistryView, network: NetworkHandle, timing: &TimingConfig) -> Self {
        let (min_interval, max_interval) = timing.refresh_range();
        Self {
            registry,
            network,
            min_interval,
            max_interval: max_interval.max(min_interval),
            read_timeout: timing.command_timeout(),
        }
    }

    /// Random delay in `[min, max]` until the next sweep.
    pub fn next_interval(&self) -> Duration {
        let min = self.min_interval.as_millis() as u64;
        let max = self.max_interval.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Read every binding of every available, non-coordinator device.
    ///
    /// Works on a snapshot of the address list; devices removed mid-sweep are
    /// skipped. A failing read never stops the sweep.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for ieee in self.registry.addresses().await {
            let Some(record) = self.registry.lookup_by_address(&ieee).await else {
                continue;
            };
            if record.is_coordinator || !record.available {
                continue;
            }
            report.devices += 1;

            for binding in record.bindings() {
                report.attempted += 1;
                let spec = cluster_spec(binding.cluster);
                let result = match self.network.current() {
                    Ok(network) => tokio::time::timeout(
                        self.read_timeout,
                        network.read_attributes(
                            &ieee,
                            binding.endpoint,
                            binding.cluster.id(),
                            spec.refresh_attributes,
                        ),
                    )
                    .await
                    .unwrap_or(Err(NetworkError::Timeout(self.read_timeout))),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    report.failed += 1;
                    debug!(
                        "Error updating cluster 0x{:04x} for device {}: {}",
                        binding.cluster.id(),
                        ieee,
                        e
                    );
                }
            }
        }
        report
    }

    /// Sweep forever on a jittered interval until shutdown is signalled.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Periodic refresh every {}-{}s",
                self.min_interval.as_secs(),
                self.max_interval.as_secs()
            );
            loop {
                let delay = self.next_interval();
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    report = self.sweep() => debug!(
                        "Refresh sweep: {} devices, {} reads, {} failed",
                        report.devices, report.attempted, report.failed
                    ),
                }
            }
            debug!("Periodic refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::GatewayAdapter;
    use crate::network::{DeviceInfo, DeviceNetwork};
    use crate::simulator::{Fault, SimulatedNetwork};
    use zigbridge_core::{EndpointDescriptor, EventBus, Ieee, Nwk};

    #[test]
    fn test_interval_within_range() {
        let refresher = PeriodicRefresher::new(
            RegistryView::new(Arc::new(crate::registry::DeviceRegistry::new())),
            NetworkHandle::new(),
            &TimingConfig::default(),
        );
        for _ in 0..100 {
            let delay = refresher.next_interval();
            assert!(delay >= Duration::from_secs(30) && delay <= Duration::from_secs(45));
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_unavailable_and_coordinator() {
        let network = Arc::new(SimulatedNetwork::new());
        network.initialize().await.unwrap();
        network.add_device(
            DeviceInfo::new(Ieee::from_u64(1), Nwk(1))
                .with_endpoints(vec![EndpointDescriptor::new(1, vec![0x0006, 0x0402])]),
        );
        network.add_device(
            DeviceInfo::new(Ieee::from_u64(2), Nwk(2))
                .with_endpoints(vec![EndpointDescriptor::new(1, vec![0x0006])]),
        );
        let handle = NetworkHandle::with_network(network.clone());
        let timing = TimingConfig::default();
        let adapter = GatewayAdapter::new(handle.clone(), EventBus::new(), &timing);
        adapter.sync_devices().await.unwrap();
        network.set_available(&Ieee::from_u64(2), false);
        adapter
            .handle_event(crate::network::NetworkEvent::AvailabilityChanged {
                ieee: Ieee::from_u64(2),
                available: false,
            })
            .await;

        let refresher = PeriodicRefresher::new(adapter.registry(), handle, &timing);
        network.script_faults(Ieee::from_u64(1), 0x0402, [Fault::Error("busy".into())]);
        let report = refresher.sweep().await;

        assert_eq!(
            report,
            SweepReport {
                devices: 1,
                attempted: 2,
                failed: 1
            }
        );
        assert_eq!(network.reads().len(), 2);
    }
}
