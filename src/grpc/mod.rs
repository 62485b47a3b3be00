//! gRPC plumbing: the host-side client with its call router, and the
//! plugin-side dispatcher.

pub mod client;
pub mod router;
pub mod server;

pub use client::GrpcDatabaseClient;
pub use router::SessionTagger;
pub use server::{DatabaseDispatcher, MultiplexingSupportService};
