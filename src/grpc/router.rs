//! Client-side call router.
//!
//! Installed as a `tonic` interceptor on a session's client, so every unary
//! call and every stream-opening call carries the session's identifier
//! before it reaches the shared channel.

use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::errors::{Error, Result};
use crate::plugin::handshake::MULTIPLEX_METADATA_KEY;

/// Attaches `multiplex_id: <session id>` to outgoing call metadata.
///
/// The value is fixed at construction. Dedicated sessions use
/// [`SessionTagger::untagged`] and send calls unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionTagger {
    value: Option<AsciiMetadataValue>,
}

impl SessionTagger {
    pub fn new(session_id: &str) -> Result<Self> {
        let value = AsciiMetadataValue::try_from(session_id).map_err(|_| {
            Error::id_generation(format!("session id {:?} is not valid metadata", session_id))
        })?;
        Ok(Self { value: Some(value) })
    }

    pub fn untagged() -> Self {
        Self { value: None }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.value.as_ref().and_then(|v| v.to_str().ok())
    }
}

impl Interceptor for SessionTagger {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        if let Some(value) = &self.value {
            request.metadata_mut().insert(MULTIPLEX_METADATA_KEY, value.clone());
        }
        Ok(request)
    }
}
