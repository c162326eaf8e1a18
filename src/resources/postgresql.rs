use crate::{
    Context, Result,
    adapter::{Adapter, Target},
    credentials::Credentials,
};

pub mod database;
pub mod user;

use database::PostgreSQLDatabase;

/// Adapter on the server behind `record`, connected to `database` or to the
/// maintenance database when `None`.
pub async fn connect(
    ctx: &Context,
    record: &PostgreSQLDatabase,
    root: &Credentials,
    database: Option<&str>,
) -> Result<Box<dyn Adapter>> {
    let address = root.address_or(
        record.spec.address.as_deref(),
        record.spec.root_secret.address_field(),
    )?;
    ctx.connector
        .connect(Target::Postgresql {
            address: &address,
            username: &root.username,
            password: &root.password,
            database,
            accept_invalid_certs: ctx.settings.postgres_accept_invalid_certs,
        })
        .await
}
