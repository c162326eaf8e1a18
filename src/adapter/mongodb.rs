use async_trait::async_trait;
use mongodb::{
    Client,
    bson::{Document, doc},
    error::ErrorKind,
    options::{ClientOptions, Credential},
};
use std::time::Duration;
use tracing::*;

use super::{APP_NAME, Adapter, Role, UserRequest, with_scheme};
use crate::{Result, conditions::reasons};

const AUTH_SOURCE: &str = "admin";
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
const USER_NOT_FOUND: i32 = 11;

pub struct MongodbAdapter {
    client: Client,
}

impl MongodbAdapter {
    /// Connect to `address` (`host:port` or a `mongodb://` URI), authenticating against `admin`.
    pub async fn connect(address: &str, username: &str, password: &str) -> Result<Self> {
        Self::try_connect(address, username, password)
            .await
            .map_err(|e| e.with_reason(reasons::CONNECTION_FAILED))
    }

    async fn try_connect(address: &str, username: &str, password: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(with_scheme("mongodb", address)).await?;
        options.credential = Some(
            Credential::builder()
                .username(username.to_string())
                .password(password.to_string())
                .source(AUTH_SOURCE.to_string())
                .build(),
        );
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let client = Client::with_options(options)?;
        client
            .database(AUTH_SOURCE)
            .run_command(doc! { "ping": 1 })
            .await?;

        info!("Connected to MongoDB address={address} user={username}");
        Ok(MongodbAdapter { client })
    }

    async fn user_exists(&self, database: &str, username: &str) -> Result<bool> {
        Ok(self
            .client
            .database(AUTH_SOURCE)
            .collection::<Document>("system.users")
            .find_one(doc! { "user": username, "db": database })
            .await?
            .is_some())
    }

    async fn command_ignoring_missing_user(&self, database: &str, command: Document) -> Result<()> {
        match self.client.database(database).run_command(command).await {
            Ok(_) => Ok(()),
            Err(e) if is_user_not_found(&e) => {
                debug!(%database, "User already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_user_not_found(err: &mongodb::error::Error) -> bool {
    matches!(*err.kind, ErrorKind::Command(ref c) if c.code == USER_NOT_FOUND)
}

#[async_trait]
impl Adapter for MongodbAdapter {
    async fn ensure_database(&self, database: &str) -> Result<()> {
        debug!(%database, "MongoDB creates databases on first write");
        Ok(())
    }

    async fn ensure_user(&self, request: UserRequest<'_>) -> Result<()> {
        let exists = self.user_exists(request.database, request.username).await?;
        let command = user_command(&request, exists);

        self.client
            .database(request.database)
            .run_command(command)
            .await?;
        if !exists {
            info!(user = %request.username, database = %request.database, "Created user");
        }
        Ok(())
    }

    async fn drop_user(&self, database: &str, username: &str) -> Result<()> {
        self.command_ignoring_missing_user(database, doc! { "dropUser": username })
            .await
    }

    async fn revoke_privileges(&self, database: &str, username: &str) -> Result<()> {
        let roles: Vec<Document> = vec![];
        self.command_ignoring_missing_user(
            database,
            doc! { "updateUser": username, "roles": roles },
        )
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.client.shutdown().await;
        Ok(())
    }
}

/// `createUser` for new users, `updateUser` for existing ones.
pub fn user_command(request: &UserRequest<'_>, exists: bool) -> Document {
    let verb = if exists { "updateUser" } else { "createUser" };

    let mut command = Document::new();
    command.insert(verb, request.username);
    command.insert("pwd", request.password);
    command.insert("roles", role_documents(request.roles, request.database));
    command
}

/// Role documents, `readWrite` on `database` when none are declared.
pub fn role_documents(roles: &[Role], database: &str) -> Vec<Document> {
    if roles.is_empty() {
        return vec![doc! { "role": "readWrite", "db": database }];
    }

    roles
        .iter()
        .map(|role| {
            doc! {
                "role": role.name.as_str(),
                "db": role.database.as_deref().unwrap_or(database),
            }
        })
        .collect()
}
