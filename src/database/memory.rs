//! In-memory reference backend.
//!
//! Keeps users in a map instead of talking to a real database. It is what the
//! bundled `memdb-database-plugin` binary serves and what the tests drive
//! through the full host → plugin path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::RwLock;

use super::types::*;
use super::{Database, Password};
use crate::errors::{Error, Result};

/// Backend type reported by [`InMemoryDatabase`].
pub const MEMDB_TYPE: &str = "memdb";

const MAX_USERNAME_LEN: usize = 63;

#[derive(Debug, Clone)]
struct UserRecord {
    password: Password,
    expiration: DateTime<Utc>,
}

/// A backend whose "database" is a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    config: RwLock<Option<ConfigMap>>,
    users: RwLock<HashMap<String, UserRecord>>,
    closed: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users currently stored.
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Whether `username` exists with `password`.
    pub async fn verify_password(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .await
            .get(username)
            .is_some_and(|record| record.password.expose() == password)
    }

    pub async fn expiration_of(&self, username: &str) -> Option<DateTime<Utc>> {
        self.users.read().await.get(username).map(|record| record.expiration)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend {
                code: tonic::Code::FailedPrecondition,
                message: "database is closed".to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.ensure_open()?;
        if self.config.read().await.is_none() {
            return Err(Error::Backend {
                code: tonic::Code::FailedPrecondition,
                message: "database has not been initialized".to_string(),
            });
        }
        Ok(())
    }
}

/// `v-{display}-{role}-{random}-{unix seconds}`, capped at 63 characters.
fn generate_username(meta: &UsernameMetadata) -> String {
    let suffix: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(20).map(char::from).collect();

    let mut username = format!(
        "v-{}-{}-{}-{}",
        sanitize(&meta.display_name),
        sanitize(&meta.role_name),
        suffix,
        Utc::now().timestamp()
    );
    username.truncate(MAX_USERNAME_LEN);
    username
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(10)
        .collect();
    if cleaned.is_empty() {
        "none".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        self.ensure_open()?;
        if req.verify_connection && !req.config.contains_key("connection_url") {
            return Err(Error::invalid_request(
                "connection_url is required when verify_connection is set",
            ));
        }

        *self.config.write().await = Some(req.config.clone());
        tracing::debug!(keys = req.config.len(), "memdb initialized");
        Ok(InitializeResponse { config: req.config })
    }

    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse> {
        self.ensure_initialized().await?;
        req.validate()?;

        let username = generate_username(&req.username_config);
        self.users.write().await.insert(
            username.clone(),
            UserRecord { password: req.password, expiration: req.expiration },
        );
        Ok(NewUserResponse { username })
    }

    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse> {
        self.ensure_initialized().await?;
        req.validate()?;

        let mut users = self.users.write().await;
        let record = users
            .get_mut(&req.username)
            .ok_or_else(|| Error::invalid_request(format!("unknown user '{}'", req.username)))?;

        if let Some(change) = req.password {
            record.password = change.new_password;
        }
        if let Some(change) = req.expiration {
            record.expiration = change.new_expiration;
        }
        Ok(UpdateUserResponse {})
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse> {
        self.ensure_initialized().await?;
        req.validate()?;

        // Deleting a user that is already gone is not an error.
        self.users.write().await.remove(&req.username);
        Ok(DeleteUserResponse {})
    }

    async fn type_name(&self) -> Result<String> {
        Ok(MEMDB_TYPE.to_string())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.users.write().await.clear();
        Ok(())
    }
}
