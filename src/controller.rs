use crate::{
    Context, Error, Result, State, leader,
    reconcile::{self, Reconcile},
    resources,
};
use futures::{Stream, StreamExt};
use k8s_openapi::{NamespaceResourceScope, api::core::v1::Secret};
use kube::{
    api::{Api, ListParams, Resource},
    client::Client,
    runtime::{
        WatchStreamExt,
        controller::{self, Controller},
        predicates,
        reflector::{self, Store},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc};
use tracing::*;

pub static FINALIZER: &str = "dbprovisioning.infra.doodle.com/finalizer";

/// Namespaces and labels the controllers watch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatchScope {
    /// `None` watches every namespace
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

impl WatchScope {
    pub fn new(
        watch_all_namespaces: bool,
        runtime_namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Self {
        WatchScope {
            namespace: runtime_namespace
                .filter(|ns| !watch_all_namespaces && !ns.is_empty())
                .map(str::to_string),
            label_selector: label_selector
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn api<K>(&self, client: Client) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    /// Watch config for records; secondary objects are never label filtered.
    pub fn records(&self) -> watcher::Config {
        match &self.label_selector {
            Some(selector) => watcher::Config::default().labels(selector),
            None => watcher::Config::default(),
        }
    }

    pub fn secrets(&self, client: Client) -> Api<Secret> {
        self.api(client)
    }
}

/// Fails with [`Error::MissingCrds`] unless the kind is served.
pub async fn ensure_installed<K>(api: &Api<K>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if api.list(&ListParams::default().limit(1)).await.is_err() {
        return Err(Error::MissingCrds);
    }
    Ok(())
}

/// Reflected watch over the records of `K`, skipping status-only updates.
pub fn watch<K: Reconcile>(
    client: Client,
    scope: &WatchScope,
) -> (
    Store<K>,
    impl Stream<Item = Result<K, watcher::Error>> + Send + 'static,
) {
    let (reader, writer) = reflector::store();
    let stream = watcher(scope.api::<K>(client), scope.records())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run `controller` until shutdown is signalled.
pub async fn drive<K: Reconcile>(controller: Controller<K>, ctx: Arc<Context>) {
    let concurrency = ctx.settings.concurrent;
    info!("Starting {} controller", K::kind(&()));

    controller
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::reconcile::<K>, reconcile::error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("reconciled {}", obj.name),
                Err(e) => debug!("reconcile error: {}", e),
            }
        })
        .await;

    info!("{} controller stopped", K::kind(&()));
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) -> Result<()> {
    let kube_client = Client::try_default().await?;
    let settings = state.settings();

    let elector = if settings.enable_leader_election {
        let elector = leader::LeaderElector::new(kube_client.clone(), settings);
        elector.acquire().await?;
        Some(elector)
    } else {
        None
    };

    let scope = WatchScope::new(
        settings.watch_all_namespaces,
        settings.runtime_namespace.as_deref(),
        settings.watch_label_selector.as_deref(),
    );
    info!(?scope, "Watching records");

    let ctx = state.to_context(kube_client.clone()).await;
    let controllers = async {
        tokio::try_join!(
            resources::mongodb::database::run(ctx.clone(), scope.clone()),
            resources::mongodb::user::run(ctx.clone(), scope.clone()),
            resources::postgresql::database::run(ctx.clone(), scope.clone()),
            resources::postgresql::user::run(ctx.clone(), scope.clone()),
        )
        .map(|_| ())
    };
    let lease = async {
        match elector {
            Some(elector) => elector.hold().await,
            None => futures::future::pending().await,
        }
    };

    state.set_ready(true);
    let result = tokio::select! {
        res = controllers => res,
        res = lease => res,
    };
    state.set_ready(false);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_follows_runtime_namespace() {
        let scope = WatchScope::new(false, Some("db-system"), None);
        assert_eq!(scope.namespace.as_deref(), Some("db-system"));

        let scope = WatchScope::new(true, Some("db-system"), Some("team=a"));
        assert_eq!(scope.namespace, None);
        assert_eq!(scope.label_selector.as_deref(), Some("team=a"));
    }

    #[test]
    fn unset_namespace_watches_everything() {
        assert_eq!(WatchScope::new(false, None, Some("")), WatchScope::default());
        assert_eq!(WatchScope::new(false, Some(""), None), WatchScope::default());
    }

    #[test]
    fn label_selector_only_applies_to_records() {
        let scope = WatchScope::new(true, None, Some("team=a"));
        assert_eq!(scope.records().label_selector.as_deref(), Some("team=a"));
    }
}
