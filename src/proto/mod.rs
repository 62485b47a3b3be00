//! Wire schema for the database plugin protocol.

pub mod convert;

/// Messages and services generated from `proto/dbplugin/v5/database.proto`.
#[allow(clippy::all)]
pub mod pb {
    tonic::include_proto!("dbplugin.v5");
}
