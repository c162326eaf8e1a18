use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::*;

use crate::{Error, Result};

pub const DEFAULT_USER_FIELD: &str = "username";
pub const DEFAULT_PASSWORD_FIELD: &str = "password";
pub const DEFAULT_ADDRESS_FIELD: &str = "address";

/// Reference to a secret holding a username, password and optional address
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the referring record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_field: Option<String>,
}

impl SecretReference {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }

    pub fn user_field(&self) -> &str {
        self.user_field.as_deref().unwrap_or(DEFAULT_USER_FIELD)
    }

    pub fn password_field(&self) -> &str {
        self.password_field.as_deref().unwrap_or(DEFAULT_PASSWORD_FIELD)
    }

    pub fn address_field(&self) -> &str {
        self.address_field.as_deref().unwrap_or(DEFAULT_ADDRESS_FIELD)
    }

    /// `namespace/name` key under which referring records are indexed
    pub fn index_key(&self, default_namespace: &str) -> String {
        crate::index::key(self.namespace_or(default_namespace), &self.name)
    }
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub address: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

impl Credentials {
    /// The secret's address wins over the one declared on the record.
    pub fn address_or(&self, declared: Option<&str>, address_field: &str) -> Result<String> {
        self.address
            .as_deref()
            .or(declared)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::MissingAddress(address_field.to_string()))
    }
}

/// Fetch the referenced secret and extract the credential fields from it.
pub async fn resolve(
    client: &Client,
    reference: &SecretReference,
    default_namespace: &str,
) -> Result<Credentials> {
    let namespace = reference.namespace_or(default_namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    debug!(secret = %reference.name, %namespace, "Resolving credentials");

    let secret = secrets
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(crate::index::key(namespace, &reference.name)))?;

    extract(&secret, reference)
}

/// Extract credentials from an already fetched secret.
pub fn extract(secret: &Secret, reference: &SecretReference) -> Result<Credentials> {
    let required = |field: &str| {
        field_value(secret, field)?.ok_or_else(|| Error::CredentialsNotFound {
            secret: secret_key(secret),
            field: field.to_string(),
        })
    };

    Ok(Credentials {
        username: required(reference.user_field())?,
        password: required(reference.password_field())?,
        address: field_value(secret, reference.address_field())?,
    })
}

fn field_value(secret: &Secret, field: &str) -> Result<Option<String>> {
    if let Some(value) = secret.data.as_ref().and_then(|data| data.get(field)) {
        return String::from_utf8(value.0.clone())
            .map(Some)
            .map_err(|_| Error::InvalidCredentials {
                secret: secret_key(secret),
                field: field.to_string(),
            });
    }
    Ok(secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(field))
        .cloned())
}

fn secret_key(secret: &Secret) -> String {
    crate::index::key(&secret.namespace().unwrap_or_default(), &secret.name_any())
}
