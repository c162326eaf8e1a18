use crate::{
    Context, Error, Result,
    adapter::release,
    conditions::{reasons, types},
    controller::{self, WatchScope},
    credentials::{self, SecretReference},
    index::{self, ReferenceIndex},
    reconcile::Reconcile,
    resources::{DatabaseStatus, SECRET_INDEX},
};
use async_trait::async_trait;
use kube::{
    CustomResource, ResourceExt,
    runtime::{controller::Controller, watcher},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::*;

/// Database on a MongoDB server or Atlas project
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "MongoDBDatabase",
    group = "dbprovisioning.infra.doodle.com",
    version = "v1beta1",
    namespaced,
    shortname = "mongodb",
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"DatabaseReady\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"DatabaseReady\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBDatabaseSpec {
    /// `host:port` or connection URI, overridden by the root secret's address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Defaults to the record name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    pub root_secret: SecretReference,
    /// Atlas project id; when set the root secret holds the API key pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atlas_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl MongoDBDatabase {
    pub fn database_name(&self) -> String {
        self.spec
            .database_name
            .clone()
            .unwrap_or_else(|| self.name_any())
    }
}

#[async_trait]
impl Reconcile for MongoDBDatabase {
    type Status = DatabaseStatus;

    const READY_CONDITION: &'static str = types::DATABASE_READY;
    const SUCCESS_REASON: &'static str = reasons::DATABASE_PROVISIONING_SUCCESSFUL;
    const FAILURE_REASON: &'static str = reasons::DATABASE_PROVISIONING_FAILED;

    fn status(&self) -> Option<&DatabaseStatus> {
        self.status.as_ref()
    }

    fn timeout(&self) -> Option<&str> {
        self.spec.timeout.as_deref()
    }

    async fn apply(&self, ctx: &Context, _status: &mut DatabaseStatus) -> Result<()> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let root = credentials::resolve(&ctx.kube_client, &self.spec.root_secret, &namespace).await?;

        let adapter = super::connect(ctx, self, &root).await?;
        let result = adapter
            .ensure_database(&self.database_name())
            .await
            .map_err(|e| e.with_reason(reasons::CREATE_DATABASE_FAILED));
        release(adapter, result).await
    }

    async fn cleanup(&self, _ctx: &Context, _status: &mut DatabaseStatus) -> Result<()> {
        info!(
            "Releasing MongoDBDatabase \"{}\", contents of {} are kept",
            self.name_any(),
            self.database_name()
        );
        Ok(())
    }
}

pub fn secret_keys(database: &MongoDBDatabase) -> Vec<String> {
    vec![
        database
            .spec
            .root_secret
            .index_key(&database.namespace().unwrap_or_default()),
    ]
}

/// Initialize the controller (given the crd is installed)
pub async fn run(ctx: Arc<Context>, scope: WatchScope) -> Result<()> {
    let client = ctx.kube_client.clone();
    controller::ensure_installed(&scope.api::<MongoDBDatabase>(client.clone())).await?;

    let (store, records) = controller::watch::<MongoDBDatabase>(client.clone(), &scope);
    let referrers = ReferenceIndex::new(store.clone()).with_index(SECRET_INDEX, secret_keys);

    let controller = Controller::for_stream(records, store).watches(
        scope.secrets(client),
        watcher::Config::default(),
        move |secret| referrers.lookup(SECRET_INDEX, &index::key_of(&secret)),
    );
    controller::drive(controller, ctx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FINALIZER,
        fixtures::{self, timeout_after_1s},
        reconcile::reconcile,
    };
    use kube::runtime::controller::Action;
    use serde_json::json;
    use std::time::Duration;

    fn database() -> MongoDBDatabase {
        let mut database = MongoDBDatabase::new(
            "orders",
            MongoDBDatabaseSpec {
                root_secret: SecretReference {
                    name: "root".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        database.metadata.namespace = Some("default".into());
        database.metadata.resource_version = Some("1".into());
        database.metadata.generation = Some(1);
        database
    }

    const PATH: &str = "/apis/dbprovisioning.infra.doodle.com/v1beta1/namespaces/default/mongodbdatabases/orders";

    #[test]
    fn database_name_defaults_to_record_name() {
        let mut database = database();
        assert_eq!(database.database_name(), "orders");
        database.spec.database_name = Some("orders-v2".into());
        assert_eq!(database.database_name(), "orders-v2");
    }

    #[test]
    fn indexes_root_secret() {
        let mut database = database();
        assert_eq!(secret_keys(&database), vec!["default/root"]);
        database.spec.root_secret.namespace = Some("infra".into());
        assert_eq!(secret_keys(&database), vec!["infra/root"]);
    }

    #[tokio::test]
    async fn new_records_get_a_finalizer() {
        let (ctx, server) = fixtures::context();
        let database = database();
        let mut finalized = database.clone();
        finalized.metadata.finalizers = Some(vec![FINALIZER.into()]);

        let mocksrv = tokio::spawn(async move {
            server
                .patch(
                    PATH,
                    json!({"metadata": {"finalizers": [FINALIZER], "resourceVersion": "1"}}),
                    json!(finalized),
                )
                .await;
        });

        let action = reconcile(Arc::new(database), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn missing_root_secret_is_reported() {
        let (ctx, server) = fixtures::context();
        let mut database = database();
        database.metadata.finalizers = Some(vec![FINALIZER.into()]);
        let response = json!(database.clone());

        let mocksrv = tokio::spawn(async move {
            server
                .get_not_found("/api/v1/namespaces/default/secrets/root")
                .await
                .event(reasons::SECRET_NOT_FOUND)
                .await
                .patch_status(
                    PATH,
                    json!({
                        "status": {
                            "conditions": [{
                                "type": "DatabaseReady",
                                "status": "False",
                                "reason": "SecretNotFoundFailed",
                            }],
                            "observedGeneration": 1,
                        }
                    }),
                    response,
                )
                .await;
        });

        let err = reconcile(Arc::new(database), ctx).await.unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(_)));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deletion_keeps_contents_and_releases_finalizer() {
        let (ctx, server) = fixtures::context();
        let mut database = database();
        database.metadata.finalizers = Some(vec![FINALIZER.into(), "other".into()]);
        database.metadata.deletion_timestamp = Some(fixtures::deletion_timestamp());
        let response = json!(database.clone());

        let mocksrv = tokio::spawn(async move {
            server
                .patch_status(
                    PATH,
                    json!({
                        "status": {
                            "conditions": [{
                                "type": "DatabaseReady",
                                "status": "False",
                                "reason": "Finalized",
                            }],
                        }
                    }),
                    response.clone(),
                )
                .await
                .patch(
                    PATH,
                    json!({"metadata": {"finalizers": ["other"]}}),
                    response,
                )
                .await
                .event(reasons::FINALIZED)
                .await;
        });

        let action = reconcile(Arc::new(database), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn released_record_forgets_its_backoff() {
        let (ctx, _server) = fixtures::context();
        let key = "MongoDBDatabase/default/orders";
        ctx.backoff.next(key);
        assert!(ctx.backoff.next(key) > Duration::from_secs(8));

        let mut database = database();
        database.metadata.deletion_timestamp = Some(fixtures::deletion_timestamp());
        let action = reconcile(Arc::new(database), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.backoff.next(key) < Duration::from_secs(6));
    }
}
