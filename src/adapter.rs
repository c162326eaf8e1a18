//! Uniform capability set over a live database server.
//!
//! An adapter owns exactly one connection. Reconcilers open a fresh adapter per
//! pass and hand it back through [`release`]; adapters also release their
//! connection on drop, which covers cancelled and timed out reconciles.

use async_trait::async_trait;
use tracing::*;

use crate::Result;

pub mod atlas;
mod digest;
pub mod mongodb;
pub mod postgresql;

pub use atlas::AtlasAdapter;
pub use self::mongodb::MongodbAdapter;
pub use postgresql::PostgresqlAdapter;

static APP_NAME: &str = env!("CARGO_PKG_NAME");

/// A role granted to a user. Mongo roles are scoped to a database, Postgres
/// roles are plain role names.
#[derive(Clone, Debug, PartialEq)]
pub struct Role {
    pub name: String,
    pub database: Option<String>,
}

/// `GRANT <privileges> ON <object> <object_name>`
#[derive(Clone, Debug, PartialEq)]
pub struct Grant {
    pub object: String,
    pub object_name: String,
    pub privileges: Vec<String>,
}

/// Desired state of a user on one database
#[derive(Clone, Copy, Debug)]
pub struct UserRequest<'a> {
    pub database: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub roles: &'a [Role],
    pub grants: &'a [Grant],
}

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn ensure_database(&self, database: &str) -> Result<()>;

    /// Create the user or converge its password and roles to `request`.
    async fn ensure_user(&self, request: UserRequest<'_>) -> Result<()>;

    async fn drop_user(&self, database: &str, username: &str) -> Result<()>;

    async fn enable_extension(&self, database: &str, extension: &str) -> Result<()> {
        debug!(%database, %extension, "Extensions are not supported by this engine");
        Ok(())
    }

    async fn ensure_schema(&self, database: &str, schema: &str) -> Result<()> {
        debug!(%database, %schema, "Schemas are not supported by this engine");
        Ok(())
    }

    async fn set_search_path(&self, database: &str, search_path: &[String]) -> Result<()> {
        debug!(%database, ?search_path, "Search paths are not supported by this engine");
        Ok(())
    }

    async fn revoke_privileges(&self, database: &str, username: &str) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Close `adapter` and pass `result` through. Close failures are logged only.
pub async fn release<T>(adapter: Box<dyn Adapter>, result: Result<T>) -> Result<T> {
    if let Err(e) = adapter.close().await {
        warn!("Closing database connection failed: {e}");
    }
    result
}

/// Server an adapter is opened against, with the credentials to use
#[derive(Clone, Copy)]
pub enum Target<'a> {
    Postgresql {
        address: &'a str,
        username: &'a str,
        password: &'a str,
        /// `None` selects the maintenance database
        database: Option<&'a str>,
        accept_invalid_certs: bool,
    },
    Mongodb {
        address: &'a str,
        username: &'a str,
        password: &'a str,
    },
    Atlas {
        url: &'a str,
        group_id: &'a str,
        public_key: &'a str,
        private_key: &'a str,
    },
}

/// Opens adapters for reconcilers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: Target<'_>) -> Result<Box<dyn Adapter>>;
}

/// Connects to real servers over the engines' own protocols
#[derive(Clone, Copy, Debug, Default)]
pub struct Engines;

#[async_trait]
impl Connector for Engines {
    async fn connect(&self, target: Target<'_>) -> Result<Box<dyn Adapter>> {
        let adapter: Box<dyn Adapter> = match target {
            Target::Postgresql {
                address,
                username,
                password,
                database,
                accept_invalid_certs,
            } => Box::new(
                PostgresqlAdapter::connect(
                    address,
                    username,
                    password,
                    database,
                    accept_invalid_certs,
                )
                .await?,
            ),
            Target::Mongodb {
                address,
                username,
                password,
            } => Box::new(MongodbAdapter::connect(address, username, password).await?),
            Target::Atlas {
                url,
                group_id,
                public_key,
                private_key,
            } => Box::new(AtlasAdapter::connect(url, group_id, public_key, private_key).await?),
        };
        Ok(adapter)
    }
}

/// Prefix `address` with `scheme` unless it already carries one.
fn with_scheme(scheme: &str, address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("{scheme}://{address}")
    }
}
