use crate::{
    Context, Error, Result,
    adapter::{Adapter, Grant, Role, UserRequest, release},
    conditions::{reasons, types},
    controller::{self, WatchScope},
    credentials::{Credentials, SecretReference},
    index::{self, ReferenceIndex},
    reconcile::{Reconcile, bounded},
    resources::{
        self, DATABASE_INDEX, DatabaseReference, SECRET_INDEX, UserStatus,
        postgresql::database::PostgreSQLDatabase,
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

/// User of a PostgreSQLDatabase
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "PostgreSQLUser",
    group = "dbprovisioning.infra.doodle.com",
    version = "v1beta1",
    namespaced,
    shortname = "pguser",
    status = "UserStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"UserReady\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"UserReady\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct PostgreSQLUserSpec {
    pub database: DatabaseReference,
    pub credentials: SecretReference,
    /// Roles the user is made a member of
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub grants: Vec<PostgreSQLGrant>,
}

/// `GRANT <privileges> ON <object> <objectName>`, e.g. `SELECT` on `TABLE app.orders`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLGrant {
    pub object: String,
    pub object_name: String,
    pub privileges: Vec<String>,
}

impl PostgreSQLUser {
    fn roles(&self) -> Vec<Role> {
        self.spec
            .roles
            .iter()
            .map(|name| Role {
                name: name.clone(),
                database: None,
            })
            .collect()
    }

    fn grants(&self) -> Vec<Grant> {
        self.spec
            .grants
            .iter()
            .map(|grant| Grant {
                object: grant.object.clone(),
                object_name: grant.object_name.clone(),
                privileges: grant.privileges.clone(),
            })
            .collect()
    }

    async fn provision(
        &self,
        ctx: &Context,
        namespace: &str,
        database: &PostgreSQLDatabase,
        status: &mut UserStatus,
    ) -> Result<()> {
        let (root, user) = resources::user_credentials(
            ctx,
            namespace,
            &database.spec.root_secret,
            &self.spec.credentials,
        )
        .await?;

        let name = database.database_name();
        let adapter = super::connect(ctx, database, &root, Some(&name)).await?;
        let result = self.converge(adapter.as_ref(), &name, &user, status).await;
        release(adapter, result).await
    }

    /// Lock out a previously provisioned user of another name, then record
    /// and converge the current one. The username is recorded before the
    /// user is created so that finalization covers a partial creation.
    async fn converge(
        &self,
        adapter: &dyn Adapter,
        database: &str,
        user: &Credentials,
        status: &mut UserStatus,
    ) -> Result<()> {
        if let Some(previous) = status.username.as_deref().filter(|p| *p != user.username) {
            info!("Username changed from {previous} to {}, locking out {previous}", user.username);
            lock_out(adapter, database, previous).await?;
        }
        status.username = Some(user.username.clone());

        let roles = self.roles();
        let grants = self.grants();
        adapter
            .ensure_user(UserRequest {
                database,
                username: &user.username,
                password: &user.password,
                roles: &roles,
                grants: &grants,
            })
            .await
    }

    async fn disable(
        &self,
        ctx: &Context,
        namespace: &str,
        database: &PostgreSQLDatabase,
        username: &str,
    ) -> Result<()> {
        let root = resources::root_credentials(ctx, namespace, &database.spec.root_secret).await?;
        let name = database.database_name();
        let adapter = super::connect(ctx, database, &root, Some(&name)).await?;
        let result = lock_out(adapter.as_ref(), &name, username).await;
        release(adapter, result).await
    }
}

/// Rotate the password to a random value nobody knows, then revoke database
/// privileges. The role survives since it may own objects.
pub async fn lock_out(adapter: &dyn Adapter, database: &str, username: &str) -> Result<()> {
    let password = hex::encode(rand::random::<[u8; 32]>());
    adapter
        .ensure_user(UserRequest {
            database,
            username,
            password: &password,
            roles: &[],
            grants: &[],
        })
        .await?;
    adapter.revoke_privileges(database, username).await
}

#[async_trait]
impl Reconcile for PostgreSQLUser {
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
        let database: PostgreSQLDatabase =
            resources::referenced_database(ctx, &namespace, &self.spec.database).await?;

        bounded(
            database.spec.timeout.as_deref(),
            self.provision(ctx, &namespace, &database, status),
        )
        .await
    }

    async fn cleanup(&self, ctx: &Context, status: &mut UserStatus) -> Result<()> {
        let Some(username) = status.username.clone() else {
            info!("PostgreSQLUser \"{}\" was never provisioned", self.name_any());
            return Ok(());
        };
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let Some(database) = resources::found(
            resources::referenced_database::<PostgreSQLDatabase>(
                ctx,
                &namespace,
                &self.spec.database,
            )
            .await,
        )?
        else {
            return Ok(());
        };

        bounded(
            database.spec.timeout.as_deref(),
            self.disable(ctx, &namespace, &database, &username),
        )
        .await?;
        info!("Revoked {username} on {}", database.database_name());
        Ok(())
    }
}

pub fn secret_keys(user: &PostgreSQLUser) -> Vec<String> {
    vec![
        user.spec
            .credentials
            .index_key(&user.namespace().unwrap_or_default()),
    ]
}

pub fn database_keys(user: &PostgreSQLUser) -> Vec<String> {
    vec![index::key(
        &user.namespace().unwrap_or_default(),
        &user.spec.database.name,
    )]
}

/// Initialize the controller (given the crd is installed)
pub async fn run(ctx: Arc<Context>, scope: WatchScope) -> Result<()> {
    let client = ctx.kube_client.clone();
    controller::ensure_installed(&scope.api::<PostgreSQLUser>(client.clone())).await?;

    let (store, records) = controller::watch::<PostgreSQLUser>(client.clone(), &scope);
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
            scope.api::<PostgreSQLDatabase>(client),
            scope.records(),
            move |database| databases.lookup(DATABASE_INDEX, &index::key_of(&database)),
        );
    controller::drive(controller, ctx).await;
    Ok(())
}
