use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url, header, redirect};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::*;

use super::{Adapter, Role, UserRequest, digest};
use crate::conditions::reasons;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("BadStatusCode: {0}")]
    BadStatusCode(StatusCode),

    #[error("Serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("InvalidUrl: {0}")]
    InvalidUrl(String),

    #[error("MissingDigestChallenge")]
    MissingDigestChallenge,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

pub const DEFAULT_URL: &str = "https://cloud.mongodb.com/api/atlas/v1.0";

/// Client for the Atlas admin API of one project
#[derive(Clone)]
pub struct AtlasClient {
    url: String,
    group_id: String,
    public_key: String,
    private_key: String,
    http_client: Client,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AtlasRole {
    pub database_name: String,
    pub role_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUser {
    pub database_name: String,
    pub group_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub roles: Vec<AtlasRole>,
}

impl AtlasClient {
    pub fn new(
        url: &str,
        group_id: &str,
        public_key: &str,
        private_key: &str,
    ) -> Result<AtlasClient, Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "Content-Type",
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            "Accept",
            header::HeaderValue::from_static("application/json"),
        );

        let http_client = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(AtlasClient {
            url: url.trim_end_matches('/').to_string(),
            group_id: group_id.to_string(),
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
            http_client,
        })
    }

    /// Project scoped endpoint, each segment percent-encoded on its own
    fn endpoint(&self, segments: &[&str]) -> Result<String> {
        let mut url =
            Url::parse(&self.url).map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.url)))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.url.clone()))?
            .pop_if_empty()
            .extend(["groups", self.group_id.as_str()])
            .extend(segments);
        Ok(url.into())
    }

    fn group_url(&self) -> Result<String> {
        self.endpoint(&[])
    }

    fn user_url(&self, auth_database: &str, username: &str) -> Result<String> {
        self.endpoint(&["databaseUsers", auth_database, username])
    }

    /// Send a request, answering the digest challenge of the first response.
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response> {
        let uri = digest_uri(url)?;

        let response = self.request(method.clone(), url, body, None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(digest::Challenge::parse)
            .ok_or(Error::MissingDigestChallenge)?;
        let authorization = challenge.authorization(
            &self.public_key,
            &self.private_key,
            method.as_str(),
            &uri,
            &digest::cnonce(),
            1,
        );

        self.request(method, url, body, Some(authorization)).await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        authorization: Option<String>,
    ) -> Result<Response> {
        let mut request = self.http_client.request(method, url);
        if let Some(authorization) = authorization {
            request = request.header(header::AUTHORIZATION, authorization);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Verifies the keys can read the project.
    pub async fn get_group(&self) -> Result<()> {
        let res = self.send(Method::GET, &self.group_url()?, None).await?;
        expect_success(res.status())
    }

    pub async fn get_user(&self, auth_database: &str, username: &str) -> Result<Option<DatabaseUser>> {
        let res = self
            .send(Method::GET, &self.user_url(auth_database, username)?, None)
            .await?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(res.json::<DatabaseUser>().await?)),
            status => Err(Error::BadStatusCode(status)),
        }
    }

    pub async fn create_user(&self, user: &DatabaseUser) -> Result<()> {
        let body = serde_json::to_value(user)?;
        let res = self
            .send(
                Method::POST,
                &self.endpoint(&["databaseUsers"])?,
                Some(&body),
            )
            .await?;
        expect_success(res.status())
    }

    pub async fn update_user(&self, user: &DatabaseUser) -> Result<()> {
        let body = serde_json::to_value(user)?;
        let res = self
            .send(
                Method::PATCH,
                &self.user_url(&user.database_name, &user.username)?,
                Some(&body),
            )
            .await?;
        expect_success(res.status())
    }

    /// Deleting a missing user succeeds.
    pub async fn delete_user(&self, auth_database: &str, username: &str) -> Result<()> {
        let res = self
            .send(Method::DELETE, &self.user_url(auth_database, username)?, None)
            .await?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status => expect_success(status),
        }
    }
}

fn expect_success(status: StatusCode) -> Result<()> {
    if !status.is_success() {
        return Err(Error::BadStatusCode(status));
    }
    Ok(())
}

/// Request target covered by the digest, path plus query
fn digest_uri(url: &str) -> Result<String> {
    let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    Ok(match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    })
}

/// Atlas user payload for `request`; `database` doubles as auth database.
pub fn database_user(group_id: &str, request: &UserRequest<'_>) -> DatabaseUser {
    let roles = if request.roles.is_empty() {
        vec![AtlasRole {
            database_name: request.database.to_string(),
            role_name: "readWrite".to_string(),
        }]
    } else {
        request.roles.iter().map(|r| atlas_role(r, request.database)).collect()
    };

    DatabaseUser {
        database_name: request.database.to_string(),
        group_id: group_id.to_string(),
        username: request.username.to_string(),
        password: Some(request.password.to_string()),
        roles,
    }
}

fn atlas_role(role: &Role, database: &str) -> AtlasRole {
    AtlasRole {
        database_name: role.database.clone().unwrap_or_else(|| database.to_string()),
        role_name: role.name.clone(),
    }
}

pub struct AtlasAdapter {
    client: AtlasClient,
}

impl AtlasAdapter {
    pub async fn connect(
        url: &str,
        group_id: &str,
        public_key: &str,
        private_key: &str,
    ) -> crate::Result<Self> {
        let connect = async {
            let client = AtlasClient::new(url, group_id, public_key, private_key)?;
            client.get_group().await?;
            Ok::<_, Error>(client)
        };
        let client = connect
            .await
            .map_err(|e| crate::Error::from(e).with_reason(reasons::CONNECTION_FAILED))?;

        info!("Connected to Atlas group={group_id}");
        Ok(AtlasAdapter { client })
    }
}

#[async_trait]
impl Adapter for AtlasAdapter {
    async fn ensure_database(&self, database: &str) -> crate::Result<()> {
        debug!(%database, "Atlas databases are created on first write");
        Ok(())
    }

    async fn ensure_user(&self, request: UserRequest<'_>) -> crate::Result<()> {
        let user = database_user(&self.client.group_id, &request);

        if self
            .client
            .get_user(request.database, request.username)
            .await?
            .is_some()
        {
            self.client.update_user(&user).await?;
        } else {
            self.client.create_user(&user).await?;
            info!(user = %request.username, "Created Atlas database user");
        }
        Ok(())
    }

    async fn drop_user(&self, database: &str, username: &str) -> crate::Result<()> {
        Ok(self.client.delete_user(database, username).await?)
    }

    async fn revoke_privileges(&self, database: &str, username: &str) -> crate::Result<()> {
        // Atlas users must hold at least one role, removal goes through drop_user.
        debug!(%database, %username, "Atlas privileges are revoked by dropping the user");
        Ok(())
    }

    async fn close(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }
}
