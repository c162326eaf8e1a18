use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::{
    Context, Error, Result,
    conditions::{Condition, Conditions, reasons},
    credentials::{self, Credentials, SecretReference},
    index,
};

pub mod mongodb;
pub mod postgresql;

/// Index of records by the secrets they reference
pub const SECRET_INDEX: &str = "secret";
/// Index of user records by the database record they reference
pub const DATABASE_INDEX: &str = "database";

/// Reference to a database record in the namespace of the user record
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DatabaseReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Conditions for DatabaseStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.observed_generation = generation;
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Server side user name, used for revocation on deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Conditions for UserStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.observed_generation = generation;
    }
}

/// Fetch the database record a user record points at.
pub async fn referenced_database<D>(
    ctx: &Context,
    namespace: &str,
    reference: &DatabaseReference,
) -> Result<D>
where
    D: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
{
    let databases: Api<D> = Api::namespaced(ctx.kube_client.clone(), namespace);
    databases
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::DatabaseNotFound(index::key(namespace, &reference.name)))
}

/// Root credentials of the database and credentials of the user itself.
///
/// Either secret being unusable is reported as missing credentials on the user.
pub async fn user_credentials(
    ctx: &Context,
    namespace: &str,
    root: &SecretReference,
    user: &SecretReference,
) -> Result<(Credentials, Credentials)> {
    let root = root_credentials(ctx, namespace, root).await?;
    let user = credentials::resolve(&ctx.kube_client, user, namespace)
        .await
        .map_err(|e| e.with_reason(reasons::CREDENTIALS_NOT_FOUND))?;
    Ok((root, user))
}

pub async fn root_credentials(
    ctx: &Context,
    namespace: &str,
    root: &SecretReference,
) -> Result<Credentials> {
    credentials::resolve(&ctx.kube_client, root, namespace)
        .await
        .map_err(|e| e.with_reason(reasons::CREDENTIALS_NOT_FOUND))
}

/// `None` when the record is gone, other failures are passed through.
pub fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::DatabaseNotFound(key)) => {
            tracing::warn!("Database {key} is gone, nothing left to release");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
