//! Instrumented backend wrapper.
//!
//! Wraps any [`Database`] and records a span, an operation counter and a
//! latency histogram for every call. Request payloads (passwords included)
//! are never logged; only the operation name, outcome and username where
//! one is part of the request.
//!
//! ```rust,ignore
//! let db = InstrumentedDatabase::new(InMemoryDatabase::new());
//! serve(db, &ServeOptions::from_env()).await?;
//! ```

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use super::types::*;
use super::Database;
use crate::errors::Result;
use crate::observability::MetricsRecorder;

/// Instrumenting wrapper for [`Database`] implementations.
pub struct InstrumentedDatabase<D> {
    inner: D,
    metrics: MetricsRecorder,
}

impl<D: Database> InstrumentedDatabase<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, metrics: MetricsRecorder::new() }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn observe<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = crate::db_span!(operation);
        let start = Instant::now();
        let result = call.instrument(span.clone()).await;
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(_) => {
                span.record("status", "ok");
                tracing::debug!(parent: &span, operation, elapsed, "backend operation completed");
            }
            Err(e) => {
                span.record("status", "error");
                tracing::warn!(parent: &span, operation, error = %e, "backend operation failed");
            }
        }
        self.metrics.record_database_operation(operation, elapsed, result.is_ok());
        result
    }
}

#[async_trait]
impl<D: Database> Database for InstrumentedDatabase<D> {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        self.observe("initialize", self.inner.initialize(req)).await
    }

    async fn new_user(&self, req: NewUserRequest) -> Result<NewUserResponse> {
        self.observe("new_user", self.inner.new_user(req)).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> Result<UpdateUserResponse> {
        tracing::debug!(username = %req.username, "updating user");
        self.observe("update_user", self.inner.update_user(req)).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> Result<DeleteUserResponse> {
        tracing::debug!(username = %req.username, "deleting user");
        self.observe("delete_user", self.inner.delete_user(req)).await
    }

    async fn type_name(&self) -> Result<String> {
        self.observe("type", self.inner.type_name()).await
    }

    async fn close(&self) -> Result<()> {
        self.observe("close", self.inner.close()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryDatabase, Password};
    use crate::errors::Error;
    use chrono::Utc;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_forwards_and_logs_failures() {
        let db = InstrumentedDatabase::new(InMemoryDatabase::new());

        let err = db
            .new_user(NewUserRequest {
                username_config: UsernameMetadata::default(),
                password: Password::new("do-not-log-me"),
                expiration: Utc::now(),
                statements: Statements::default(),
                rollback_statements: Statements::default(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Backend { .. }));
        assert!(logs_contain("backend operation failed"));
        assert!(!logs_contain("do-not-log-me"));
    }

    #[tokio::test]
    async fn test_forwards_successful_calls() {
        let db = InstrumentedDatabase::new(InMemoryDatabase::new());
        db.initialize(InitializeRequest::default()).await.unwrap();
        assert_eq!(db.type_name().await.unwrap(), "memdb");
        assert_eq!(db.inner().user_count().await, 0);
    }
}
