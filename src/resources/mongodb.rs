use crate::{
    Context, Result,
    adapter::{Adapter, Target},
    credentials::Credentials,
};

pub mod database;
pub mod user;

use database::MongoDBDatabase;

/// Adapter for the server behind `database`: the Atlas admin API when the
/// record names an Atlas project, the wire protocol otherwise.
pub async fn connect(
    ctx: &Context,
    database: &MongoDBDatabase,
    root: &Credentials,
) -> Result<Box<dyn Adapter>> {
    if let Some(group_id) = &database.spec.atlas_group_id {
        return ctx
            .connector
            .connect(Target::Atlas {
                url: &ctx.settings.atlas_url,
                group_id,
                public_key: &root.username,
                private_key: &root.password,
            })
            .await;
    }

    let address = root.address_or(
        database.spec.address.as_deref(),
        database.spec.root_secret.address_field(),
    )?;
    ctx.connector
        .connect(Target::Mongodb {
            address: &address,
            username: &root.username,
            password: &root.password,
        })
        .await
}
