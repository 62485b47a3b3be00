//! gRPC request spans for the plugin-side server.
//!
//! Plugged into `tower_http::trace::TraceLayer` so every inbound call gets a
//! span named after its service and method, tagged with the session it was
//! routed for.

use http::Request;
use tower_http::classify::{GrpcErrorsAsFailures, SharedClassifier};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info_span, Span};

use crate::plugin::handshake::MULTIPLEX_METADATA_KEY;

/// Builds one `grpc.server` span per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcMakeSpan;

impl<B> MakeSpan<B> for GrpcMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let (service, method) = parse_grpc_path(request.uri().path());
        let session = request
            .headers()
            .get(MULTIPLEX_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");

        info_span!(
            "grpc.server",
            rpc.system = "grpc",
            rpc.service = %service,
            rpc.method = %method,
            multiplex_id = %session,
        )
    }
}

/// The layer installed on the plugin server.
pub fn grpc_trace_layer() -> TraceLayer<SharedClassifier<GrpcErrorsAsFailures>, GrpcMakeSpan> {
    TraceLayer::new_for_grpc().make_span_with(GrpcMakeSpan)
}

/// Parse gRPC path into service and method names
///
/// gRPC paths are formatted as `/package.ServiceName/MethodName`
fn parse_grpc_path(path: &str) -> (&str, &str) {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match parts.as_slice() {
        [service, method] => (*service, *method),
        [single] if !single.is_empty() => (*single, "unknown"),
        _ => ("unknown", "unknown"),
    }
}
