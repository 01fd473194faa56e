//! Command Dispatcher.
//!
//! Resolves bus commands to a device binding, encodes them and issues them
//! against the Device Network under a per-attempt timeout. Only timeouts are
//! retried; any other failure ends the command at once. The dispatcher never
//! publishes: it reports the outcome together with the value that was
//! applied, and the bridge decides what to publish.

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zigbridge_core::{AttributeValue, Capability, Ieee, TimingConfig};

use crate::codec::{encode, ClusterCommand, EncodeError, Operation};
use crate::network::{DeviceNetwork, NetworkError, NetworkHandle, NetworkResult};
use crate::registry::RegistryView;

/// Normalized command from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub ieee: Ieee,
    pub capability: Capability,
    pub operation: Operation,
    pub correlation_id: Uuid,
}

impl Command {
    pub fn new(ieee: Ieee, capability: Capability, operation: Operation) -> Self {
        Self {
            ieee,
            capability,
            operation,
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Result of dispatching one [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success {
        endpoint: u8,
        command: ClusterCommand,
        /// Value the device now holds, for the confirming state publish.
        value: AttributeValue,
        attempts: u32,
    },
    NotFound,
    Unavailable,
    Unsupported,
    TimeoutAfterRetries {
        attempts: u32,
    },
    /// Non-timeout failure; never retried.
    Failed(String),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Unsupported => "unsupported",
            Self::TimeoutAfterRetries { .. } => "timeout_after_retries",
            Self::Failed(_) => "failed",
        }
    }
}

/// Result of a permit-join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermitJoinOutcome {
    Applied { attempts: u32 },
    TimeoutAfterRetries { attempts: u32 },
    Failed(String),
}

/// Attempts, per-attempt timeout and delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn commands(timing: &TimingConfig) -> Self {
        Self {
            attempts: timing.command_attempts.max(1),
            timeout: timing.command_timeout(),
            delay: timing.retry_delay(),
        }
    }

    pub fn permit_join(timing: &TimingConfig) -> Self {
        Self {
            attempts: timing.command_attempts.max(1),
            timeout: timing.command_timeout(),
            delay: timing.permit_join_retry_delay(),
        }
    }
}

enum AttemptFailure {
    Exhausted(u32),
    Failed(NetworkError),
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub retries: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

/// Issues commands against the Device Network.
pub struct CommandDispatcher {
    registry: RegistryView,
    network: NetworkHandle,
    commands: RetryPolicy,
    permit_join: RetryPolicy,
    counters: Arc<Counters>,
}

impl CommandDispatcher {
    pub fn new(registry: RegistryView, network: NetworkHandle, timing: &TimingConfig) -> Self {
        Self {
            registry,
            network,
            commands: RetryPolicy::commands(timing),
            permit_join: RetryPolicy::permit_join(timing),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Resolve, encode and issue a command.
    pub async fn dispatch(&self, command: &Command) -> DispatchOutcome {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let outcome = self.resolve_and_send(command).await;
        if outcome.is_success() {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn resolve_and_send(&self, command: &Command) -> DispatchOutcome {
        let ieee = command.ieee;
        let Some(record) = self.registry.lookup_by_address(&ieee).await else {
            return DispatchOutcome::NotFound;
        };
        if !record.available {
            return DispatchOutcome::Unavailable;
        }
        if !command.capability.is_commandable() || !record.has_capability(command.capability) {
            return DispatchOutcome::Unsupported;
        }
        let Some(binding) = record.binding_for(command.capability.cluster()) else {
            return DispatchOutcome::Unsupported;
        };

        let cluster_command = match encode(binding.cluster, &command.operation) {
            Ok(cluster_command) => cluster_command,
            Err(EncodeError::Unsupported { .. }) => return DispatchOutcome::Unsupported,
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        };

        let endpoint = binding.endpoint;
        let context = format!(
            "{} to device {} [{}]",
            cluster_command.name(),
            ieee,
            command.correlation_id
        );
        debug!("Sending {} on endpoint {}", context, endpoint);

        let result = self
            .run_with_retry(self.commands, &context, move |network| {
                Box::pin(async move { network.send_command(&ieee, endpoint, cluster_command).await })
            })
            .await;

        match result {
            Ok(attempts) => DispatchOutcome::Success {
                endpoint,
                command: cluster_command,
                value: command.operation.applied_value(),
                attempts,
            },
            Err(AttemptFailure::Exhausted(attempts)) => {
                DispatchOutcome::TimeoutAfterRetries { attempts }
            }
            // The device left between lookup and send.
            Err(AttemptFailure::Failed(NetworkError::DeviceNotFound(_))) => {
                DispatchOutcome::NotFound
            }
            Err(AttemptFailure::Failed(e)) => DispatchOutcome::Failed(e.to_string()),
        }
    }

    /// Open (non-zero duration) or close the network for joining.
    pub async fn permit_join(&self, duration: Duration) -> PermitJoinOutcome {
        let context = format!("permit join ({}s)", duration.as_secs());
        let result = self
            .run_with_retry(self.permit_join, &context, move |network| {
                Box::pin(async move { network.permit_join(duration).await })
            })
            .await;
        match result {
            Ok(attempts) => {
                info!(
                    "Permit join {} for {} seconds",
                    if duration.is_zero() { "disabled" } else { "enabled" },
                    duration.as_secs()
                );
                PermitJoinOutcome::Applied { attempts }
            }
            Err(AttemptFailure::Exhausted(attempts)) => {
                PermitJoinOutcome::TimeoutAfterRetries { attempts }
            }
            Err(AttemptFailure::Failed(e)) => PermitJoinOutcome::Failed(e.to_string()),
        }
    }

    /// Run `op` against the live network until it succeeds, fails with a
    /// non-timeout error, or the attempts are used up.
    async fn run_with_retry<F>(
        &self,
        policy: RetryPolicy,
        context: &str,
        op: F,
    ) -> Result<u32, AttemptFailure>
    where
        F: Fn(Arc<dyn DeviceNetwork>) -> BoxFuture<'static, NetworkResult<()>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.network.current() {
                Ok(network) => match tokio::time::timeout(policy.timeout, op(network)).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::Timeout(policy.timeout)),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_timeout() && attempt < policy.attempts => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Timeout sending {}, attempt {} of {}",
                        context, attempt, policy.attempts
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) if e.is_timeout() => return Err(AttemptFailure::Exhausted(attempt)),
                Err(e) => return Err(AttemptFailure::Failed(e)),
            }
        }
    }
}
