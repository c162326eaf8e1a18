use crate::{
    Context, Error, Result,
    adapter::{Adapter, release},
    conditions::{Conditions, reasons, types},
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

pub const DEFAULT_SEARCH_PATH: &str = "public";

/// Database on a PostgreSQL server
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "PostgreSQLDatabase",
    group = "dbprovisioning.infra.doodle.com",
    version = "v1beta1",
    namespaced,
    shortname = "pgdb",
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"DatabaseReady\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"DatabaseReady\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLDatabaseSpec {
    /// `host:port` or connection URI, overridden by the root secret's address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Defaults to the record name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    pub root_secret: SecretReference,
    #[serde(default)]
    pub extensions: Vec<Extension>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    /// Defaults to `public`
    #[serde(default)]
    pub search_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Extension {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Schema {
    pub name: String,
}

impl PostgreSQLDatabase {
    pub fn database_name(&self) -> String {
        self.spec
            .database_name
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    pub fn search_path(&self) -> Vec<String> {
        if self.spec.search_path.is_empty() {
            return vec![DEFAULT_SEARCH_PATH.to_string()];
        }
        self.spec.search_path.clone()
    }

    async fn provision_contents(
        &self,
        adapter: &dyn Adapter,
        database: &str,
        status: &mut DatabaseStatus,
    ) -> Result<()> {
        if !self.spec.extensions.is_empty() {
            let result = async {
                for extension in &self.spec.extensions {
                    adapter.enable_extension(database, &extension.name).await?;
                }
                Ok::<_, Error>(())
            }
            .await;
            record_step(
                status,
                types::EXTENSIONS_READY,
                reasons::EXTENSIONS_CREATED,
                reasons::CREATE_EXTENSIONS_FAILED,
                result,
            )?;
        }

        if !self.spec.schemas.is_empty() {
            let result = async {
                for schema in &self.spec.schemas {
                    adapter.ensure_schema(database, &schema.name).await?;
                }
                Ok::<_, Error>(())
            }
            .await;
            record_step(
                status,
                types::SCHEMAS_READY,
                reasons::SCHEMAS_CREATED,
                reasons::CREATE_SCHEMAS_FAILED,
                result,
            )?;
        }

        adapter
            .set_search_path(database, &self.search_path())
            .await
            .map_err(|e| e.with_reason(reasons::CREATE_SCHEMAS_FAILED))
    }
}

/// Mirror the outcome of one provisioning step into its own condition.
fn record_step(
    status: &mut DatabaseStatus,
    type_: &str,
    success: &str,
    failure: &'static str,
    result: Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => {
            status.set_condition(type_, true, success, "");
            Ok(())
        }
        Err(e) => {
            status.set_condition(type_, false, failure, &e.to_string());
            Err(e.with_reason(failure))
        }
    }
}

#[async_trait]
impl Reconcile for PostgreSQLDatabase {
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

    async fn apply(&self, ctx: &Context, status: &mut DatabaseStatus) -> Result<()> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let root = credentials::resolve(&ctx.kube_client, &self.spec.root_secret, &namespace).await?;
        let database = self.database_name();

        let adapter = super::connect(ctx, self, &root, None).await?;
        let result = adapter
            .ensure_database(&database)
            .await
            .map_err(|e| e.with_reason(reasons::CREATE_DATABASE_FAILED));
        release(adapter, result).await?;

        let adapter = super::connect(ctx, self, &root, Some(&database)).await?;
        let result = self
            .provision_contents(adapter.as_ref(), &database, status)
            .await;
        release(adapter, result).await
    }

    async fn cleanup(&self, _ctx: &Context, _status: &mut DatabaseStatus) -> Result<()> {
        info!(
            "Releasing PostgreSQLDatabase \"{}\", contents of {} are kept",
            self.name_any(),
            self.database_name()
        );
        Ok(())
    }
}

pub fn secret_keys(database: &PostgreSQLDatabase) -> Vec<String> {
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
    controller::ensure_installed(&scope.api::<PostgreSQLDatabase>(client.clone())).await?;

    let (store, records) = controller::watch::<PostgreSQLDatabase>(client.clone(), &scope);
    let referrers = ReferenceIndex::new(store.clone()).with_index(SECRET_INDEX, secret_keys);

    let controller = Controller::for_stream(records, store).watches(
        scope.secrets(client),
        watcher::Config::default(),
        move |secret| referrers.lookup(SECRET_INDEX, &index::key_of(&secret)),
    );
    controller::drive(controller, ctx).await;
    Ok(())
}
