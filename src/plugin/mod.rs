//! Plugin process lifecycle: handshake, launching, negotiation and the
//! plugin-side serve loop.

pub mod handshake;
pub mod negotiator;
pub mod runner;
pub mod serve;
pub mod subprocess;

pub use handshake::{HandshakeConfig, HandshakeLine, LEGACY_VERSION, MULTIPLEX_VERSION};
pub use negotiator::{AcquireState, Capability, Negotiated, Negotiator};
pub use runner::{PluginRunner, ProcessHandle, RunConfig, SpawnedPlugin};
pub use serve::{serve, serve_multiplex, PluginServer, ServeOptions};
pub use subprocess::{ChildProcess, SubprocessRunner};
