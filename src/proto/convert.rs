//! Conversions between the host-facing types in [`crate::database`] and the
//! generated wire messages.
//!
//! Host → wire conversions are infallible. Wire → host conversions validate
//! required fields and fail with [`Error::InvalidRequest`].

use chrono::{DateTime, Utc};
use prost_types::value::Kind;
use serde_json::{Number, Value};

use super::pb;
use crate::database::types::*;
use crate::database::Password;
use crate::errors::{Error, Result};

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

pub fn timestamp_from_datetime(at: &DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

pub fn datetime_from_timestamp(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos)
        .map_err(|_| Error::invalid_request(format!("negative nanos in timestamp: {}", ts.nanos)))?;
    DateTime::from_timestamp(ts.seconds, nanos)
        .ok_or_else(|| Error::invalid_request(format!("timestamp out of range: {}", ts.seconds)))
}

fn required_datetime(ts: Option<prost_types::Timestamp>, field: &str) -> Result<DateTime<Utc>> {
    let ts = ts.ok_or_else(|| Error::invalid_request(format!("missing {}", field)))?;
    datetime_from_timestamp(&ts)
}

/// JSON object → `google.protobuf.Struct`.
pub fn struct_from_map(map: &ConfigMap) -> prost_types::Struct {
    prost_types::Struct {
        fields: map.iter().map(|(k, v)| (k.clone(), value_to_proto(v))).collect(),
    }
}

/// `google.protobuf.Struct` → JSON object.
pub fn map_from_struct(value: prost_types::Struct) -> ConfigMap {
    value.fields.into_iter().map(|(k, v)| (k, value_from_proto(v))).collect()
}

fn value_to_proto(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(value_to_proto).collect(),
        }),
        Value::Object(map) => Kind::StructValue(struct_from_map(map)),
    };
    prost_types::Value { kind: Some(kind) }
}

fn value_from_proto(value: prost_types::Value) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::NumberValue(n)) => number_from_f64(n),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(value_from_proto).collect())
        }
        Some(Kind::StructValue(s)) => Value::Object(map_from_struct(s)),
    }
}

/// Struct numbers are always doubles; whole values come back as integers so
/// that e.g. `max_open_connections = 4` survives the trip unchanged.
fn number_from_f64(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Statements> for pb::Statements {
    fn from(s: Statements) -> Self {
        Self { commands: s.commands }
    }
}

impl From<pb::Statements> for Statements {
    fn from(s: pb::Statements) -> Self {
        Self { commands: s.commands }
    }
}

fn statements(s: Option<pb::Statements>) -> Statements {
    s.map(Statements::from).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Initialize
// ---------------------------------------------------------------------------

impl From<InitializeRequest> for pb::InitializeRequest {
    fn from(req: InitializeRequest) -> Self {
        Self {
            config_data: Some(struct_from_map(&req.config)),
            verify_connection: req.verify_connection,
        }
    }
}

impl From<pb::InitializeRequest> for InitializeRequest {
    fn from(req: pb::InitializeRequest) -> Self {
        Self {
            config: req.config_data.map(map_from_struct).unwrap_or_default(),
            verify_connection: req.verify_connection,
        }
    }
}

impl From<InitializeResponse> for pb::InitializeResponse {
    fn from(resp: InitializeResponse) -> Self {
        Self { config_data: Some(struct_from_map(&resp.config)) }
    }
}

impl From<pb::InitializeResponse> for InitializeResponse {
    fn from(resp: pb::InitializeResponse) -> Self {
        Self { config: resp.config_data.map(map_from_struct).unwrap_or_default() }
    }
}

// ---------------------------------------------------------------------------
// NewUser
// ---------------------------------------------------------------------------

impl From<NewUserRequest> for pb::NewUserRequest {
    fn from(req: NewUserRequest) -> Self {
        Self {
            password: req.password.expose().to_string(),
            expiration: Some(timestamp_from_datetime(&req.expiration)),
            username_config: Some(pb::UsernameConfig {
                display_name: req.username_config.display_name,
                role_name: req.username_config.role_name,
            }),
            statements: Some(req.statements.into()),
            rollback_statements: Some(req.rollback_statements.into()),
        }
    }
}

impl TryFrom<pb::NewUserRequest> for NewUserRequest {
    type Error = Error;

    fn try_from(req: pb::NewUserRequest) -> Result<Self> {
        let username_config = req
            .username_config
            .map(|u| UsernameMetadata { display_name: u.display_name, role_name: u.role_name })
            .unwrap_or_default();

        Ok(Self {
            username_config,
            password: Password::new(req.password),
            expiration: required_datetime(req.expiration, "expiration")?,
            statements: statements(req.statements),
            rollback_statements: statements(req.rollback_statements),
        })
    }
}

impl From<NewUserResponse> for pb::NewUserResponse {
    fn from(resp: NewUserResponse) -> Self {
        Self { username: resp.username }
    }
}

impl From<pb::NewUserResponse> for NewUserResponse {
    fn from(resp: pb::NewUserResponse) -> Self {
        Self { username: resp.username }
    }
}

// ---------------------------------------------------------------------------
// UpdateUser
// ---------------------------------------------------------------------------

impl From<UpdateUserRequest> for pb::UpdateUserRequest {
    fn from(req: UpdateUserRequest) -> Self {
        Self {
            username: req.username,
            password: req.password.map(|change| pb::ChangePassword {
                new_password: change.new_password.expose().to_string(),
                statements: Some(change.statements.into()),
            }),
            expiration: req.expiration.map(|change| pb::ChangeExpiration {
                new_expiration: Some(timestamp_from_datetime(&change.new_expiration)),
                statements: Some(change.statements.into()),
            }),
        }
    }
}

impl TryFrom<pb::UpdateUserRequest> for UpdateUserRequest {
    type Error = Error;

    fn try_from(req: pb::UpdateUserRequest) -> Result<Self> {
        let password = req.password.map(|change| ChangePassword {
            new_password: Password::new(change.new_password),
            statements: statements(change.statements),
        });

        let expiration = req
            .expiration
            .map(|change| -> Result<ChangeExpiration> {
                Ok(ChangeExpiration {
                    new_expiration: required_datetime(change.new_expiration, "new expiration")?,
                    statements: statements(change.statements),
                })
            })
            .transpose()?;

        Ok(Self { username: req.username, password, expiration })
    }
}

impl From<UpdateUserResponse> for pb::UpdateUserResponse {
    fn from(_: UpdateUserResponse) -> Self {
        Self {}
    }
}

// ---------------------------------------------------------------------------
// DeleteUser
// ---------------------------------------------------------------------------

impl From<DeleteUserRequest> for pb::DeleteUserRequest {
    fn from(req: DeleteUserRequest) -> Self {
        Self { username: req.username, statements: Some(req.statements.into()) }
    }
}

impl From<pb::DeleteUserRequest> for DeleteUserRequest {
    fn from(req: pb::DeleteUserRequest) -> Self {
        Self { username: req.username, statements: statements(req.statements) }
    }
}

impl From<DeleteUserResponse> for pb::DeleteUserResponse {
    fn from(_: DeleteUserResponse) -> Self {
        Self {}
    }
}
