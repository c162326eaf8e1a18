use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use postgres_protocol::escape::{escape_identifier, escape_literal};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config};
use tracing::*;

use super::{APP_NAME, Adapter, Grant, UserRequest, with_scheme};
use crate::{Error, Result, conditions::reasons};

/// Maintenance database used when no database is selected
pub const MAINTENANCE_DATABASE: &str = "postgres";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OBJECTS: &[&str] = &[
    "TABLE",
    "SEQUENCE",
    "DATABASE",
    "DOMAIN",
    "FOREIGN DATA WRAPPER",
    "FOREIGN SERVER",
    "FUNCTION",
    "PROCEDURE",
    "ROUTINE",
    "LANGUAGE",
    "SCHEMA",
    "TABLESPACE",
    "TYPE",
    "ALL TABLES IN SCHEMA",
    "ALL SEQUENCES IN SCHEMA",
    "ALL FUNCTIONS IN SCHEMA",
    "ALL PROCEDURES IN SCHEMA",
    "ALL ROUTINES IN SCHEMA",
];

const PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
    "CREATE",
    "CONNECT",
    "TEMPORARY",
    "TEMP",
    "EXECUTE",
    "USAGE",
    "ALL",
    "ALL PRIVILEGES",
];

pub struct PostgresqlAdapter {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresqlAdapter {
    /// Connect to `database`, or to the maintenance database when `None`.
    pub async fn connect(
        address: &str,
        user: &str,
        password: &str,
        database: Option<&str>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let database = database.unwrap_or(MAINTENANCE_DATABASE);
        Self::try_connect(address, user, password, database, accept_invalid_certs)
            .await
            .map_err(|e| e.with_reason(reasons::CONNECTION_FAILED))
    }

    async fn try_connect(
        address: &str,
        user: &str,
        password: &str,
        database: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        let connector = MakeTlsConnector::new(connector);

        let (client, connection) = config(address, user, password, database)?
            .connect(connector)
            .await?;

        info!("Connected to Postgresql address={address} user={user} database={database}");

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection error: {}", e);
            }
        });

        Ok(PostgresqlAdapter { client, connection })
    }

    async fn database_exists(&self, database: &str) -> Result<bool> {
        Ok(self
            .client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])
            .await?
            .is_some())
    }

    async fn role_exists(&self, role: &str) -> Result<bool> {
        Ok(self
            .client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&role])
            .await?
            .is_some())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        self.client.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PostgresqlAdapter {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl Adapter for PostgresqlAdapter {
    async fn ensure_database(&self, database: &str) -> Result<()> {
        if self.database_exists(database).await? {
            debug!(%database, "Database already exists");
            return Ok(());
        }

        self.execute(&create_database(database)).await?;

        // CREATE DATABASE may silently do nothing for roles lacking CREATEDB on some managed servers.
        if !self.database_exists(database).await? {
            return Err(Error::DatabaseNotCreated(database.to_string()));
        }
        info!(%database, "Created database");
        Ok(())
    }

    async fn ensure_user(&self, request: UserRequest<'_>) -> Result<()> {
        let statements = user_grants(&request)?;

        if !self.role_exists(request.username).await? {
            self.execute(&format!("CREATE USER {}", escape_identifier(request.username)))
                .await?;
            if !self.role_exists(request.username).await? {
                return Err(Error::UserNotCreated(request.username.to_string()));
            }
            info!(user = %request.username, "Created user");
        }

        self.execute(&alter_password(request.username, request.password))
            .await?;

        for statement in statements {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    async fn drop_user(&self, _database: &str, username: &str) -> Result<()> {
        self.execute(&format!("DROP USER IF EXISTS {}", escape_identifier(username)))
            .await
    }

    async fn enable_extension(&self, _database: &str, extension: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE EXTENSION IF NOT EXISTS {}",
            escape_identifier(extension)
        ))
        .await
    }

    async fn ensure_schema(&self, _database: &str, schema: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            escape_identifier(schema)
        ))
        .await
    }

    async fn set_search_path(&self, database: &str, search_path: &[String]) -> Result<()> {
        self.execute(&search_path_statement(database, search_path))
            .await
    }

    async fn revoke_privileges(&self, database: &str, username: &str) -> Result<()> {
        self.execute(&format!(
            "REVOKE ALL PRIVILEGES ON DATABASE {} FROM {}",
            escape_identifier(database),
            escape_identifier(username)
        ))
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Dropping the client terminates the connection task.
        drop(self);
        Ok(())
    }
}

/// Connection config for `address`, which is either `host[:port]` or a
/// `postgres://` URI. Credentials and database always come from the caller.
pub fn config(address: &str, user: &str, password: &str, database: &str) -> Result<Config> {
    let mut config: Config = with_scheme("postgresql", address).parse()?;
    config
        .user(user)
        .password(password)
        .dbname(database)
        .application_name(APP_NAME)
        .connect_timeout(CONNECT_TIMEOUT);
    Ok(config)
}

fn create_database(database: &str) -> String {
    format!("CREATE DATABASE {}", escape_identifier(database))
}

fn alter_password(user: &str, password: &str) -> String {
    format!(
        "ALTER USER {} WITH ENCRYPTED PASSWORD {}",
        escape_identifier(user),
        escape_literal(password)
    )
}

fn search_path_statement(database: &str, search_path: &[String]) -> String {
    let path = search_path
        .iter()
        .map(|s| escape_identifier(s))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "ALTER DATABASE {} SET search_path TO {}",
        escape_identifier(database),
        path
    )
}

/// Grant statements for a user, in execution order: database access, role
/// memberships, then the declared grant rules.
pub fn user_grants(request: &UserRequest<'_>) -> Result<Vec<String>> {
    let user = escape_identifier(request.username);

    let mut statements = vec![format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {user}",
        escape_identifier(request.database)
    )];
    statements.extend(
        request
            .roles
            .iter()
            .map(|role| format!("GRANT {} TO {user}", escape_identifier(&role.name))),
    );
    for grant in request.grants {
        statements.extend(grant_statements(grant, request.username)?);
    }
    Ok(statements)
}

/// `GRANT <privilege> ON <object> <objectName> TO <user>`, one per privilege.
///
/// Objects and privileges are SQL keywords and cannot be quoted, so they are
/// checked against the keywords Postgres accepts.
pub fn grant_statements(grant: &Grant, user: &str) -> Result<Vec<String>> {
    let object = normalize_keyword(&grant.object);
    if !OBJECTS.contains(&object.as_str()) {
        return Err(Error::InvalidGrant(format!("unknown object type {:?}", grant.object)));
    }
    if grant.object_name.is_empty() {
        return Err(Error::InvalidGrant(format!("missing object name for {object}")));
    }
    let object_name = match grant.object_name.split_once('(') {
        Some((name, arguments)) if ROUTINES.contains(&object.as_str()) => {
            format!("{}({})", qualified_name(name.trim()), argument_types(arguments)?)
        }
        _ => qualified_name(&grant.object_name),
    };

    grant
        .privileges
        .iter()
        .map(|privilege| {
            let privilege = normalize_keyword(privilege);
            if !PRIVILEGES.contains(&privilege.as_str()) {
                return Err(Error::InvalidGrant(format!("unknown privilege {privilege:?}")));
            }
            Ok(format!(
                "GRANT {privilege} ON {object} {object_name} TO {}",
                escape_identifier(user)
            ))
        })
        .collect()
}

/// Objects named by signature, e.g. `app.refresh(integer, text)`
const ROUTINES: &[&str] = &["FUNCTION", "PROCEDURE", "ROUTINE"];

fn qualified_name(name: &str) -> String {
    name.split('.')
        .map(escape_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

/// Argument list of a routine signature, without the closing parenthesis.
///
/// Type names cannot be quoted as a whole, so only plain type names,
/// array brackets and schema qualifiers are let through.
fn argument_types(arguments: &str) -> Result<String> {
    let invalid = || Error::InvalidGrant(format!("invalid argument list ({arguments}"));
    let arguments = arguments.trim_end().strip_suffix(')').ok_or_else(invalid)?;
    let allowed = |c: char| c.is_ascii_alphanumeric() || " \t_,.[]".contains(c);
    if !arguments.chars().all(allowed) {
        return Err(invalid());
    }
    Ok(arguments
        .split(',')
        .map(normalize_keyword)
        .filter(|argument| !argument.is_empty())
        .collect::<Vec<_>>()
        .join(", "))
}

fn normalize_keyword(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Role;

    fn request<'a>(roles: &'a [Role], grants: &'a [Grant]) -> UserRequest<'a> {
        UserRequest {
            database: "db-x",
            username: "alice",
            password: "p1",
            roles,
            grants,
        }
    }

    #[test]
    fn quotes_identifiers_in_ddl() {
        assert_eq!(create_database("db-x"), "CREATE DATABASE \"db-x\"");
        assert_eq!(
            create_database("x\"; DROP DATABASE y; --"),
            "CREATE DATABASE \"x\"\"; DROP DATABASE y; --\""
        );
    }

    #[test]
    fn escapes_password_literal() {
        assert_eq!(
            alter_password("alice", "it's"),
            "ALTER USER \"alice\" WITH ENCRYPTED PASSWORD 'it''s'"
        );
        assert!(alter_password("alice", "back\\slash").contains("E'back\\\\slash'"));
    }

    #[test]
    fn search_path_quotes_each_schema() {
        assert_eq!(
            search_path_statement("db-x", &["$user".into(), "public".into()]),
            "ALTER DATABASE \"db-x\" SET search_path TO \"$user\", \"public\""
        );
    }

    #[test]
    fn user_grants_in_order() {
        let roles = [Role {
            name: "readers".into(),
            database: None,
        }];
        let grants = [Grant {
            object: "schema".into(),
            object_name: "public".into(),
            privileges: vec!["usage".into(), "create".into()],
        }];

        assert_eq!(
            user_grants(&request(&roles, &grants)).unwrap(),
            vec![
                "GRANT ALL PRIVILEGES ON DATABASE \"db-x\" TO \"alice\"",
                "GRANT \"readers\" TO \"alice\"",
                "GRANT USAGE ON SCHEMA \"public\" TO \"alice\"",
                "GRANT CREATE ON SCHEMA \"public\" TO \"alice\"",
            ]
        );
    }

    #[test]
    fn grant_on_qualified_table() {
        let grant = Grant {
            object: "TABLE".into(),
            object_name: "app.orders".into(),
            privileges: vec!["SELECT".into()],
        };
        assert_eq!(
            grant_statements(&grant, "alice").unwrap(),
            vec!["GRANT SELECT ON TABLE \"app\".\"orders\" TO \"alice\""]
        );
    }

    #[test]
    fn multi_word_keywords_are_normalized() {
        let grant = Grant {
            object: "all  tables in schema".into(),
            object_name: "public".into(),
            privileges: vec!["all privileges".into()],
        };
        assert_eq!(
            grant_statements(&grant, "alice").unwrap(),
            vec!["GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA \"public\" TO \"alice\""]
        );
    }

    #[test]
    fn rejects_unknown_keywords() {
        let grant = Grant {
            object: "TABLE x; DROP TABLE y".into(),
            object_name: "t".into(),
            privileges: vec!["SELECT".into()],
        };
        assert!(matches!(grant_statements(&grant, "alice"), Err(Error::InvalidGrant(_))));

        let grant = Grant {
            object: "TABLE".into(),
            object_name: "t".into(),
            privileges: vec!["SELECT, DELETE".into()],
        };
        assert!(matches!(grant_statements(&grant, "alice"), Err(Error::InvalidGrant(_))));
    }

    #[test]
    fn routine_signatures_keep_their_argument_types() {
        let grant = Grant {
            object: "FUNCTION".into(),
            object_name: "app.refresh(integer,  character varying, text[])".into(),
            privileges: vec!["EXECUTE".into()],
        };
        assert_eq!(
            grant_statements(&grant, "alice").unwrap(),
            vec![
                "GRANT EXECUTE ON FUNCTION \"app\".\"refresh\"(INTEGER, CHARACTER VARYING, TEXT[]) TO \"alice\""
            ]
        );

        let grant = Grant {
            object: "procedure".into(),
            object_name: "cleanup()".into(),
            privileges: vec!["EXECUTE".into()],
        };
        assert_eq!(
            grant_statements(&grant, "alice").unwrap(),
            vec!["GRANT EXECUTE ON PROCEDURE \"cleanup\"() TO \"alice\""]
        );
    }

    #[test]
    fn rejects_injected_routine_arguments() {
        for object_name in ["f(int); DROP TABLE t; --)", "f(int", "f(\"x\")", "f(int) x"] {
            let grant = Grant {
                object: "FUNCTION".into(),
                object_name: object_name.into(),
                privileges: vec!["EXECUTE".into()],
            };
            assert!(
                matches!(grant_statements(&grant, "alice"), Err(Error::InvalidGrant(_))),
                "{object_name}"
            );
        }
    }

    #[test]
    fn config_from_plain_address_and_uri() {
        let cfg = config("pg.example:5433", "root", "pw", "db-x").unwrap();
        assert_eq!(cfg.get_user(), Some("root"));
        assert_eq!(cfg.get_dbname(), Some("db-x"));
        assert_eq!(cfg.get_ports(), &[5433]);

        let cfg = config("postgres://pg.example/other?sslmode=require", "root", "pw", "db-x").unwrap();
        assert_eq!(cfg.get_dbname(), Some("db-x"));
        assert_eq!(cfg.get_ssl_mode(), tokio_postgres::config::SslMode::Require);
    }
}
