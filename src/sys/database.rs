// src/sys/database.rs

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use zeroize::Zeroizing;

use crate::config::DatabaseConfig;
use crate::error::BackendError;
use crate::sys::command::Program;
use crate::sys::secrets::Credential;
use crate::sys::traits::{DatabaseAccount, DatabaseBackend};
use crate::sys::validate::validate_username;

#[derive(Debug, Deserialize)]
struct ShellReply {
    ok: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MongoRole {
    role: String,
    db: String,
}

#[derive(Debug, Deserialize)]
struct MongoUser {
    user: String,
    #[serde(default)]
    roles: Vec<MongoRole>,
}

/// Encodes `value` as a JavaScript string literal. JSON string syntax is a
/// subset of JS, so quotes, backslashes and newlines cannot break out.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Wraps `body` so the shell always prints exactly one JSON reply line,
/// whether the body returns or throws.
fn wrap_script(body: &str) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "try {{ const __r = (function() {{ {body} }})(); print(JSON.stringify({{ ok: 1, result: __r === undefined ? null : __r }})); }} \
         catch (e) {{ print(JSON.stringify({{ ok: 0, error: String(e && e.message ? e.message : e) }})); }}"
    ))
}

fn parse_reply(stdout: &str) -> Result<serde_json::Value, BackendError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| BackendError::unavailable("database shell returned no reply"))?;

    let reply: ShellReply = serde_json::from_str(line)
        .map_err(|e| BackendError::unavailable(format!("unreadable database shell reply: {}", e)))?;

    if reply.ok == 1 {
        return Ok(reply.result);
    }

    let message = reply.error.unwrap_or_else(|| "unknown error".to_string());
    let lowered = message.to_lowercase();
    if lowered.contains("already exists") {
        Err(BackendError::AlreadyExists(message))
    } else if lowered.contains("not found") {
        Err(BackendError::NotFound(message))
    } else {
        Err(BackendError::unavailable(message))
    }
}

/// Drops the database before the user: `list` is keyed on users, so a failure
/// halfway must leave the user behind as the visible remnant.
fn removal_body(auth_db: &str, username: &str) -> String {
    format!(
        "db.getSiblingDB({user}).dropDatabase(); db.getSiblingDB({auth}).dropUser({user}); return null;",
        auth = js_string(auth_db),
        user = js_string(username),
    )
}

fn accounts_from(result: serde_json::Value) -> Result<Vec<DatabaseAccount>, BackendError> {
    let users: Vec<MongoUser> = serde_json::from_value(result)
        .map_err(|e| BackendError::unavailable(format!("unexpected user listing: {}", e)))?;

    let mut accounts: Vec<DatabaseAccount> = users
        .into_iter()
        .map(|u| {
            let database = u
                .roles
                .iter()
                .find(|r| r.role == "dbOwner")
                .map(|r| r.db.clone())
                .unwrap_or_else(|| u.user.clone());
            DatabaseAccount { username: u.user, database }
        })
        .collect();
    accounts.sort_by(|a, b| a.username.cmp(&b.username));
    Ok(accounts)
}

/// Database backend that drives the admin shell inside the shared MongoDB container.
pub struct MongoBackend {
    docker: Program,
    container: String,
    shell: String,
    auth_db: String,
    root_username: String,
    root_password: Credential,
}

impl MongoBackend {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            docker: config.docker,
            container: config.container,
            shell: config.shell,
            auth_db: config.auth_db,
            root_username: config.root_username,
            root_password: config.root_password,
        }
    }

    /// Runs `body` as the admin user. The script, including both the admin
    /// login and any account password, goes over stdin; argv carries no secret.
    async fn eval(&self, body: &str) -> Result<serde_json::Value, BackendError> {
        let login = self.root_password.use_secret(|pw| {
            Zeroizing::new(format!(
                "db.getSiblingDB(\"admin\").auth({user}, {pwd}); {body}",
                user = js_string(&self.root_username),
                pwd = Zeroizing::new(js_string(pw)).as_str(),
            ))
        });
        let script = wrap_script(&login);

        let args = ["exec", "-i", self.container.as_str(), self.shell.as_str(), "--quiet"];
        let stdout = Zeroizing::new(self.docker.run_with_input(args, script.as_bytes()).await?);
        parse_reply(&stdout)
    }

    async fn list_users(&self) -> Result<Vec<DatabaseAccount>, BackendError> {
        let body = format!(
            "const u = db.getSiblingDB({auth}).getUsers(); return Array.isArray(u) ? u : u.users;",
            auth = js_string(&self.auth_db)
        );
        accounts_from(self.eval(&body).await?)
    }
}

#[async_trait]
impl DatabaseBackend for MongoBackend {
    async fn create_account(&self, username: &str, password: &Credential) -> Result<(), BackendError> {
        validate_username(username)?;

        if self.list_users().await?.iter().any(|a| a.username == username) {
            return Err(BackendError::AlreadyExists(format!("database account {}", username)));
        }

        let body = password.use_secret(|pw| {
            Zeroizing::new(format!(
                "db.getSiblingDB({auth}).createUser({{ user: {user}, pwd: {pwd}, roles: [{{ role: \"dbOwner\", db: {user} }}] }}); return null;",
                auth = js_string(&self.auth_db),
                user = js_string(username),
                pwd = Zeroizing::new(js_string(pw)).as_str(),
            ))
        });
        self.eval(&body).await?;

        info!(username, "database account created");
        Ok(())
    }

    async fn remove_account(&self, username: &str) -> Result<(), BackendError> {
        validate_username(username)?;

        if !self.list_users().await?.iter().any(|a| a.username == username) {
            return Err(BackendError::NotFound(format!("database account {}", username)));
        }

        self.eval(&removal_body(&self.auth_db, username)).await?;

        info!(username, "database account and database dropped");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DatabaseAccount>, BackendError> {
        self.list_users().await
    }
}
