//! Handshake between host and plugin subprocess.
//!
//! The host starts the plugin with the magic cookie and the offered
//! protocol versions in its environment. Once the plugin is listening it
//! prints exactly one line to stdout:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL
//! 1|6|tcp|127.0.0.1:41234|grpc
//! ```
//!
//! Everything after that line on stdout is ignored; logs go to stderr.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::errors::{Error, Result};

/// Version of the line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Plugin set without session multiplexing.
pub const LEGACY_VERSION: u32 = 5;

/// Plugin set with session multiplexing.
pub const MULTIPLEX_VERSION: u32 = 6;

/// Every version this crate can host, lowest first.
pub const SUPPORTED_VERSIONS: [u32; 2] = [LEGACY_VERSION, MULTIPLEX_VERSION];

/// Environment variable carrying the versions the host offers, e.g. `5,6`.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Call metadata key carrying the session identifier.
pub const MULTIPLEX_METADATA_KEY: &str = "multiplex_id";

pub const DATABASE_COOKIE_KEY: &str = "VAULT_DATABASE_PLUGIN";
pub const DATABASE_COOKIE_VALUE: &str = "926a0820-aea2-be28-51d6-83cdf00e8edb";

/// Magic cookie shared by host and plugin.
///
/// This only stops a user from launching a plugin binary by hand; it is not
/// an authentication mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            magic_cookie_key: DATABASE_COOKIE_KEY.to_string(),
            magic_cookie_value: DATABASE_COOKIE_VALUE.to_string(),
        }
    }
}

impl HandshakeConfig {
    /// Check the cookie as seen by a plugin process.
    pub fn verify<F>(&self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.magic_cookie_key) {
            Some(value) if value == self.magic_cookie_value => Ok(()),
            _ => Err(Error::handshake(format!(
                "magic cookie '{}' missing or mismatched",
                self.magic_cookie_key
            ))),
        }
    }
}

/// Parse a `PLUGIN_PROTOCOL_VERSIONS` value. Unparsable entries are skipped.
pub fn parse_versions(raw: &str) -> Vec<u32> {
    let mut versions: Vec<u32> =
        raw.split(',').filter_map(|part| part.trim().parse().ok()).collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

pub fn render_versions(versions: &[u32]) -> String {
    versions.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Highest version present in both lists.
pub fn negotiate_version(offered: &[u32], supported: &[u32]) -> Option<u32> {
    offered.iter().copied().filter(|v| supported.contains(v)).max()
}

/// The line a plugin prints once its server is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub addr: SocketAddr,
}

impl HandshakeLine {
    pub fn new(app_version: u32, addr: SocketAddr) -> Self {
        Self { core_version: CORE_PROTOCOL_VERSION, app_version, addr }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, addr, protocol] = fields.as_slice() else {
            return Err(Error::handshake(format!(
                "expected 5 '|'-separated fields, got {}: {:?}",
                fields.len(),
                line.trim()
            )));
        };

        let core_version: u32 = core
            .parse()
            .map_err(|_| Error::handshake(format!("invalid core protocol version '{}'", core)))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(Error::handshake(format!(
                "unsupported core protocol version {} (expected {})",
                core_version, CORE_PROTOCOL_VERSION
            )));
        }

        let app_version: u32 = app
            .parse()
            .map_err(|_| Error::handshake(format!("invalid app protocol version '{}'", app)))?;

        if *network != "tcp" {
            return Err(Error::handshake(format!("unsupported network '{}'", network)));
        }
        if *protocol != "grpc" {
            return Err(Error::handshake(format!("unsupported protocol '{}'", protocol)));
        }

        let addr = SocketAddr::from_str(addr)
            .map_err(|e| Error::handshake(format!("invalid address '{}': {}", addr, e)))?;

        Ok(Self { core_version, app_version, addr })
    }

    /// URI a `tonic` channel can connect to.
    pub fn endpoint_uri(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|tcp|{}|grpc", self.core_version, self.app_version, self.addr)
    }
}
