use crate::{Error, Result, Settings};
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::*;

const LEASE_TTL: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(2);

/// Holds a `coordination.k8s.io/v1` Lease so only one replica reconciles
pub struct LeaderElector {
    lock: LeaseLock,
    name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, settings: &Settings) -> Self {
        let name = settings.leader_election_id.clone();
        let identity = holder_id(
            std::env::var("POD_NAME").ok(),
            std::env::var("HOSTNAME").ok(),
        );
        let namespace = lease_namespace(settings);
        info!(holder_id = %identity, %namespace, lease_name = %name, "Initializing leader election");

        let lock = LeaseLock::new(
            client,
            namespace,
            LeaseLockParams {
                holder_id: identity.clone(),
                lease_name: name.clone(),
                lease_ttl: LEASE_TTL,
            },
        );
        LeaderElector {
            lock,
            name,
            identity,
        }
    }

    /// Block until this process holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        info!(lease = %self.name, identity = %self.identity, "Waiting to acquire leadership");
        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    return Ok(());
                }
                Ok(_) => debug!("Another instance is leader, waiting"),
                Err(e) => warn!("Failed to acquire lease: {e}, retrying"),
            }
            sleep(RENEW_INTERVAL).await;
        }
    }

    /// Keep renewing the lease; only returns once leadership is lost.
    pub async fn hold(&self) -> Result<()> {
        let mut renewed = Instant::now();
        loop {
            sleep(RENEW_INTERVAL).await;
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => renewed = Instant::now(),
                Ok(_) => {
                    error!("Lost leadership");
                    return Err(Error::LeaseLost);
                }
                Err(e) if renewed.elapsed() >= LEASE_TTL => {
                    error!("Failed to renew lease: {e}");
                    return Err(Error::LeaseLost);
                }
                Err(e) => warn!("Failed to renew lease: {e}, retrying"),
            }
        }
    }
}

/// Namespace holding the lease: explicit setting, then the runtime namespace.
fn lease_namespace(settings: &Settings) -> &str {
    settings
        .leader_election_namespace
        .as_deref()
        .or(settings.runtime_namespace.as_deref())
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
}

fn holder_id(pod_name: Option<String>, hostname: Option<String>) -> String {
    pod_name
        .or(hostname)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("db-controller-{}", hex::encode(rand::random::<[u8; 4]>())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_lives_in_the_configured_namespace() {
        let mut settings = Settings::default();
        assert_eq!(lease_namespace(&settings), "default");

        settings.runtime_namespace = Some("db-system".into());
        assert_eq!(lease_namespace(&settings), "db-system");

        settings.leader_election_namespace = Some("leases".into());
        assert_eq!(lease_namespace(&settings), "leases");
    }

    #[test]
    fn holder_prefers_pod_name() {
        assert_eq!(
            holder_id(Some("pod-a".into()), Some("host-a".into())),
            "pod-a"
        );
        assert_eq!(holder_id(None, Some("host-a".into())), "host-a");
    }

    #[test]
    fn holder_without_identity_is_random() {
        let first = holder_id(None, None);
        assert!(first.starts_with("db-controller-"));
        assert_eq!(first.len(), "db-controller-".len() + 8);
        assert_ne!(first, holder_id(Some(String::new()), None));
    }
}
