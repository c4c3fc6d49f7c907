//! Message routing for Pylon.
//!
//! The router maps each message type to a registered handler with an
//! optional payload schema and required role set. The registry is built
//! once at startup and read-only afterward, so concurrent dispatches need
//! no synchronization.
//!
//! Dispatch order: unknown type, then authorization, then schema
//! validation, then the handler. A handler failure is caught at this
//! boundary and converted to a generic error reply; it never propagates to
//! crash the connection.

use crate::identity::Identity;
use crate::rbac;
use async_trait::async_trait;
use pylon_protocol::{Envelope, Reply};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Failure reported by a handler.
#[derive(Debug, Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Payload rejected by schema validation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    /// Create a validation error with a detail message.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// A registered message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a validated, authorized envelope.
    async fn handle(
        &self,
        identity: &Identity,
        envelope: &Envelope,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Schema validation collaborator.
///
/// Only the validate contract is consumed here; the schema language and
/// its mechanics belong to the implementation.
pub trait SchemaValidator: Send + Sync {
    /// Check `payload` against `schema`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the mismatch.
    fn validate(
        &self,
        payload: &serde_json::Value,
        schema: &serde_json::Value,
    ) -> Result<(), ValidationError>;
}

/// Validator that accepts every payload. Wiring default for deployments
/// that register no schemas.
#[derive(Debug, Default)]
pub struct NoopValidator;

impl SchemaValidator for NoopValidator {
    fn validate(
        &self,
        _payload: &serde_json::Value,
        _schema: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// A handler registration entry.
pub struct Registration {
    /// Message type this handler answers.
    pub message_type: u16,
    /// The handler itself.
    pub handler: Arc<dyn MessageHandler>,
    /// Optional payload schema.
    pub schema: Option<serde_json::Value>,
    /// Roles the identity must all hold; empty means public.
    pub required_roles: HashSet<String>,
}

impl Registration {
    /// Register a public handler without a schema.
    #[must_use]
    pub fn new(message_type: u16, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            message_type,
            handler,
            schema: None,
            required_roles: HashSet::new(),
        }
    }

    /// Attach a payload schema.
    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Require a role.
    #[must_use]
    pub fn require_role(mut self, role: impl Into<String>) -> Self {
        self.required_roles.insert(role.into());
        self
    }
}

/// Startup-time registration error.
#[derive(Debug, Error)]
pub enum RouterBuildError {
    /// The same message type was registered twice.
    #[error("Duplicate message type: {0}")]
    DuplicateMessageType(u16),
}

/// Builder assembling the read-only route registry at startup.
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<u16, Registration>,
}

impl RouterBuilder {
    /// Add a registration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the message type is already
    /// registered.
    pub fn register(mut self, registration: Registration) -> Result<Self, RouterBuildError> {
        let message_type = registration.message_type;
        if self.routes.contains_key(&message_type) {
            return Err(RouterBuildError::DuplicateMessageType(message_type));
        }
        self.routes.insert(message_type, registration);
        Ok(self)
    }

    /// Finish building. The resulting registry is immutable.
    #[must_use]
    pub fn build(self, validator: Arc<dyn SchemaValidator>) -> MessageRouter {
        debug!(routes = self.routes.len(), "Message router built");
        MessageRouter {
            routes: self.routes,
            validator,
        }
    }
}

/// The message router.
pub struct MessageRouter {
    /// Write-once registry; read concurrently without locking.
    routes: HashMap<u16, Registration>,
    validator: Arc<dyn SchemaValidator>,
}

impl MessageRouter {
    /// Start building a router.
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Number of registered message types.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Check whether a message type is registered.
    #[must_use]
    pub fn has_route(&self, message_type: u16) -> bool {
        self.routes.contains_key(&message_type)
    }

    /// Validate, authorize, and dispatch an envelope.
    ///
    /// Every reply preserves the inbound `message_type` and `request_id`
    /// verbatim.
    pub async fn dispatch(&self, identity: &Identity, envelope: &Envelope) -> Reply {
        let Some(route) = self.routes.get(&envelope.message_type) else {
            debug!(
                message_type = envelope.message_type,
                principal = %identity.principal,
                "Unknown message type"
            );
            return Reply::invalid_data(envelope, "unknown message type");
        };

        if !rbac::authorize(&identity.roles, &route.required_roles) {
            debug!(
                message_type = envelope.message_type,
                principal = %identity.principal,
                "Permission denied"
            );
            return Reply::permission_denied(envelope);
        }

        if let Some(schema) = &route.schema {
            if let Err(err) = self.validator.validate(&envelope.data, schema) {
                debug!(
                    message_type = envelope.message_type,
                    detail = %err,
                    "Payload failed validation"
                );
                return Reply::invalid_data(envelope, err.to_string());
            }
        }

        trace!(
            message_type = envelope.message_type,
            request_id = %envelope.request_id,
            "Dispatching"
        );

        match route.handler.handle(identity, envelope).await {
            Ok(data) => Reply::ok(envelope, data),
            Err(err) => {
                error!(
                    message_type = envelope.message_type,
                    principal = %identity.principal,
                    error = %err,
                    "Handler failed"
                );
                Reply::error(envelope)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_protocol::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handler counting its invocations.
    struct CountingHandler {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(
            &self,
            _identity: &Identity,
            envelope: &Envelope,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(HandlerError::new("database exploded"));
            }
            Ok(json!({"echo": envelope.data}))
        }
    }

    /// Validator requiring the fields listed in the schema's `required`
    /// array to be present in the payload.
    struct RequiredFields;

    impl SchemaValidator for RequiredFields {
        fn validate(
            &self,
            payload: &serde_json::Value,
            schema: &serde_json::Value,
        ) -> Result<(), ValidationError> {
            let required = schema["required"].as_array().cloned().unwrap_or_default();
            for field in required {
                let name = field.as_str().unwrap_or_default();
                if payload.get(name).is_none() {
                    return Err(ValidationError::new(format!("missing field: {name}")));
                }
            }
            Ok(())
        }
    }

    fn identity(roles: &[&str]) -> Identity {
        Identity::new("u1", roles.iter().map(|s| (*s).to_string()))
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let router = MessageRouter::builder().build(Arc::new(NoopValidator));
        let envelope = Envelope::new(99, "r1", json!({}));

        let reply = router.dispatch(&identity(&[]), &envelope).await;
        assert_eq!(reply.status_code, StatusCode::InvalidData);
        assert_eq!(reply.data["message"], "unknown message type");
        assert_eq!(reply.message_type, 99);
        assert_eq!(reply.request_id, "r1");
    }

    #[tokio::test]
    async fn test_permission_denied_skips_handler() {
        let handler = CountingHandler::new();
        let router = MessageRouter::builder()
            .register(Registration::new(1, handler.clone()).require_role("admin"))
            .unwrap()
            .build(Arc::new(NoopValidator));

        let envelope = Envelope::new(1, "abc", json!({}));
        let reply = router.dispatch(&identity(&["user"]), &envelope).await;

        assert_eq!(reply.status_code, StatusCode::PermissionDenied);
        assert_eq!(reply.message_type, 1);
        assert_eq!(reply.request_id, "abc");
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_failure_skips_handler() {
        let handler = CountingHandler::new();
        let router = MessageRouter::builder()
            .register(
                Registration::new(2, handler.clone())
                    .with_schema(json!({"required": ["name"]})),
            )
            .unwrap()
            .build(Arc::new(RequiredFields));

        let envelope = Envelope::new(2, "r2", json!({"other": 1}));
        let reply = router.dispatch(&identity(&[]), &envelope).await;

        assert_eq!(reply.status_code, StatusCode::InvalidData);
        assert_eq!(reply.data["message"], "missing field: name");
        assert_eq!(handler.calls(), 0);

        // A conforming payload reaches the handler.
        let envelope = Envelope::new(2, "r3", json!({"name": "Ada"}));
        let reply = router.dispatch(&identity(&[]), &envelope).await;
        assert_eq!(reply.status_code, StatusCode::Ok);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_reply() {
        let handler = CountingHandler::failing();
        let router = MessageRouter::builder()
            .register(Registration::new(3, handler.clone()))
            .unwrap()
            .build(Arc::new(NoopValidator));

        let envelope = Envelope::new(3, "r4", json!({}));
        let reply = router.dispatch(&identity(&[]), &envelope).await;

        assert_eq!(reply.status_code, StatusCode::Error);
        assert_eq!(reply.message_type, 3);
        assert_eq!(reply.request_id, "r4");
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_authorized_dispatch() {
        let handler = CountingHandler::new();
        let router = MessageRouter::builder()
            .register(Registration::new(1, handler.clone()).require_role("admin"))
            .unwrap()
            .build(Arc::new(NoopValidator));

        let envelope = Envelope::new(1, "r5", json!({"k": "v"}));
        let reply = router.dispatch(&identity(&["admin", "user"]), &envelope).await;

        assert_eq!(reply.status_code, StatusCode::Ok);
        assert_eq!(reply.data["echo"]["k"], "v");
        assert_eq!(handler.calls(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = MessageRouter::builder()
            .register(Registration::new(1, CountingHandler::new()))
            .unwrap()
            .register(Registration::new(1, CountingHandler::new()));

        assert!(matches!(
            result,
            Err(RouterBuildError::DuplicateMessageType(1))
        ));
    }
}
