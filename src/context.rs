use crate::{Backoff, Diagnostics, Metrics, Settings, adapter::Connector};
use kube::Client as KubeClient;
use kube::runtime::events::Recorder;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub kube_client: KubeClient,
    /// Event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Requeue delays of failing records
    pub backoff: Arc<Backoff>,
    /// Opens database adapters
    pub connector: Arc<dyn Connector>,
}
