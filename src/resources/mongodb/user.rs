use crate::{
    Context, Error, Result,
    adapter::{Adapter, Role, UserRequest, release},
    conditions::{reasons, types},
    controller::{self, WatchScope},
    credentials::{Credentials, SecretReference},
    index::{self, ReferenceIndex},
    reconcile::{Reconcile, bounded},
    resources::{
        self, DATABASE_INDEX, DatabaseReference, SECRET_INDEX, UserStatus,
        mongodb::database::MongoDBDatabase,
    },
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

/// User of a MongoDBDatabase
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "MongoDBUser",
    group = "dbprovisioning.infra.doodle.com",
    version = "v1beta1",
    namespaced,
    shortname = "mongodbuser",
    status = "UserStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"UserReady\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"UserReady\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct MongoDBUserSpec {
    pub database: DatabaseReference,
    pub credentials: SecretReference,
    #[serde(default)]
    pub roles: Vec<MongoDBRole>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MongoDBRole {
    pub name: String,
    /// Database the role applies to, defaults to the user's database
    #[serde(default)]
    pub db: String,
}

impl MongoDBUser {
    fn roles(&self) -> Vec<Role> {
        self.spec
            .roles
            .iter()
            .map(|role| Role {
                name: role.name.clone(),
                database: Some(role.db.clone()).filter(|db| !db.is_empty()),
            })
            .collect()
    }

    async fn provision(
        &self,
        ctx: &Context,
        namespace: &str,
        database: &MongoDBDatabase,
        status: &mut UserStatus,
    ) -> Result<()> {
        let (root, user) = resources::user_credentials(
            ctx,
            namespace,
            &database.spec.root_secret,
            &self.spec.credentials,
        )
        .await?;

        let adapter = super::connect(ctx, database, &root).await?;
        let result = self
            .converge(adapter.as_ref(), &database.database_name(), &user, status)
            .await;
        release(adapter, result).await
    }

    /// Drop a previously provisioned user of another name, then record and
    /// converge the current one. Recording first lets finalization clean up
    /// after a partial creation.
    async fn converge(
        &self,
        adapter: &dyn Adapter,
        database: &str,
        user: &Credentials,
        status: &mut UserStatus,
    ) -> Result<()> {
        if let Some(previous) = status.username.as_deref().filter(|p| *p != user.username) {
            info!("Username changed from {previous} to {}, dropping {previous}", user.username);
            adapter.drop_user(database, previous).await?;
        }
        status.username = Some(user.username.clone());

        let roles = self.roles();
        adapter
            .ensure_user(UserRequest {
                database,
                username: &user.username,
                password: &user.password,
                roles: &roles,
                grants: &[],
            })
            .await
    }

    async fn drop_user(
        &self,
        ctx: &Context,
        namespace: &str,
        database: &MongoDBDatabase,
        username: &str,
    ) -> Result<()> {
        let root = resources::root_credentials(ctx, namespace, &database.spec.root_secret).await?;
        let adapter = super::connect(ctx, database, &root).await?;
        let result = adapter.drop_user(&database.database_name(), username).await;
        release(adapter, result).await
    }
}

#[async_trait]
impl Reconcile for MongoDBUser {
    type Status = UserStatus;

    const READY_CONDITION: &'static str = types::USER_READY;
    const SUCCESS_REASON: &'static str = reasons::USER_PROVISIONING_SUCCESSFUL;
    const FAILURE_REASON: &'static str = reasons::USER_PROVISIONING_FAILED;

    fn status(&self) -> Option<&UserStatus> {
        self.status.as_ref()
    }

    async fn apply(&self, ctx: &Context, status: &mut UserStatus) -> Result<()> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let database: MongoDBDatabase =
            resources::referenced_database(ctx, &namespace, &self.spec.database).await?;

        bounded(
            database.spec.timeout.as_deref(),
            self.provision(ctx, &namespace, &database, status),
        )
        .await
    }

    async fn cleanup(&self, ctx: &Context, status: &mut UserStatus) -> Result<()> {
        let Some(username) = status.username.clone() else {
            info!("MongoDBUser \"{}\" was never provisioned", self.name_any());
            return Ok(());
        };
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let Some(database) = resources::found(
            resources::referenced_database::<MongoDBDatabase>(ctx, &namespace, &self.spec.database)
                .await,
        )?
        else {
            return Ok(());
        };

        bounded(
            database.spec.timeout.as_deref(),
            self.drop_user(ctx, &namespace, &database, &username),
        )
        .await?;
        info!("Dropped user {username} from {}", database.database_name());
        Ok(())
    }
}

pub fn secret_keys(user: &MongoDBUser) -> Vec<String> {
    vec![
        user.spec
            .credentials
            .index_key(&user.namespace().unwrap_or_default()),
    ]
}

pub fn database_keys(user: &MongoDBUser) -> Vec<String> {
    vec![index::key(
        &user.namespace().unwrap_or_default(),
        &user.spec.database.name,
    )]
}

/// Initialize the controller (given the crd is installed)
pub async fn run(ctx: Arc<Context>, scope: WatchScope) -> Result<()> {
    let client = ctx.kube_client.clone();
    controller::ensure_installed(&scope.api::<MongoDBUser>(client.clone())).await?;

    let (store, records) = controller::watch::<MongoDBUser>(client.clone(), &scope);
    let secrets = ReferenceIndex::new(store.clone())
        .with_index(SECRET_INDEX, secret_keys)
        .with_index(DATABASE_INDEX, database_keys);
    let databases = secrets.clone();

    let controller = Controller::for_stream(records, store)
        .watches(
            scope.secrets(client.clone()),
            watcher::Config::default(),
            move |secret| secrets.lookup(SECRET_INDEX, &index::key_of(&secret)),
        )
        .watches(
            scope.api::<MongoDBDatabase>(client),
            scope.records(),
            move |database| databases.lookup(DATABASE_INDEX, &index::key_of(&database)),
        );
    controller::drive(controller, ctx).await;
    Ok(())
}
