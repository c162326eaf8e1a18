use crate::{
    Backoff, Context, Metrics, Settings,
    adapter::{Connector, Engines},
};
use chrono::{DateTime, Utc};
use kube::{
    client::Client as KubeClient,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::RwLock;
use tracing::*;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "db-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: KubeClient) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    metrics: Arc<Metrics>,
    /// Settings
    settings: Arc<Settings>,
    /// Whether the controllers are running
    ready: Arc<AtomicBool>,
    backoff: Arc<Backoff>,
    connector: Arc<dyn Connector>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> State {
        State {
            settings: Arc::new(settings),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::default()),
            ready: Arc::new(AtomicBool::new(false)),
            backoff: Arc::new(Backoff::default()),
            connector: Arc::new(Engines),
        }
    }

    /// Settings getter
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, registry) {
            error!("Encoding metrics failed: {e}");
        }
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, kube_client: KubeClient) -> Arc<Context> {
        Arc::new(Context {
            kube_client: kube_client.clone(),
            recorder: self.diagnostics.read().await.recorder(kube_client),
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            settings: self.settings.clone(),
            backoff: self.backoff.clone(),
            connector: self.connector.clone(),
        })
    }
}
