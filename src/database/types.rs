//! Request and response types of the database capability.
//!
//! These are the host-facing shapes; `crate::proto::convert` maps them to and
//! from the generated wire messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::secret::Password;
use crate::errors::{Error, Result};

/// Backend configuration as a JSON object.
pub type ConfigMap = Map<String, Value>;

/// Backend-specific statements, e.g. SQL templates for creating a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statements {
    pub commands: Vec<String>,
}

impl Statements {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { commands: commands.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub config: ConfigMap,
    pub verify_connection: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    /// Configuration to persist; backends may normalize or add defaults.
    pub config: ConfigMap,
}

/// Inputs a backend may use when generating a username.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameMetadata {
    pub display_name: String,
    pub role_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUserRequest {
    pub username_config: UsernameMetadata,
    pub password: Password,
    pub expiration: DateTime<Utc>,
    pub statements: Statements,
    pub rollback_statements: Statements,
}

impl NewUserRequest {
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(Error::invalid_request("missing password"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserResponse {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePassword {
    pub new_password: Password,
    pub statements: Statements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeExpiration {
    pub new_expiration: DateTime<Utc>,
    pub statements: Statements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub password: Option<ChangePassword>,
    pub expiration: Option<ChangeExpiration>,
}

impl UpdateUserRequest {
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        if self.password.is_none() && self.expiration.is_none() {
            return Err(Error::invalid_request("no changes requested"));
        }
        if let Some(change) = &self.password {
            if change.new_password.is_empty() {
                return Err(Error::invalid_request("missing new password"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    pub username: String,
    pub statements: Statements,
}

impl DeleteUserRequest {
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserResponse {}
