//! Built-in message handlers.
//!
//! Registered once at startup; application deployments add their own
//! registrations alongside these.

use crate::metrics;
use async_trait::async_trait;
use pylon_core::{
    ConnectionManager, HandlerError, Identity, MessageHandler, MessageRouter, Registration,
    RouterBuildError, RouterBuilder,
};
use pylon_protocol::{Envelope, Reply};
use serde_json::json;
use std::sync::Arc;

/// Echo the request payload back.
pub const MSG_ECHO: u16 = 0;
/// Return the caller's principal and roles.
pub const MSG_WHOAMI: u16 = 1;
/// Broadcast an operator notice to every connection (admin only).
pub const MSG_NOTICE: u16 = 2;
/// Push type of broadcast notices.
pub const MSG_NOTICE_PUSH: u16 = 100;

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(
        &self,
        _identity: &Identity,
        envelope: &Envelope,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(envelope.data.clone())
    }
}

struct WhoAmIHandler;

#[async_trait]
impl MessageHandler for WhoAmIHandler {
    async fn handle(
        &self,
        identity: &Identity,
        _envelope: &Envelope,
    ) -> Result<serde_json::Value, HandlerError> {
        let mut roles: Vec<&str> = identity.roles.iter().map(String::as_str).collect();
        roles.sort_unstable();
        Ok(json!({
            "principal": identity.principal,
            "roles": roles,
        }))
    }
}

/// Fans an operator notice out to every live connection.
struct NoticeHandler {
    manager: Arc<ConnectionManager>,
}

#[async_trait]
impl MessageHandler for NoticeHandler {
    async fn handle(
        &self,
        identity: &Identity,
        envelope: &Envelope,
    ) -> Result<serde_json::Value, HandlerError> {
        let text = envelope.data["text"]
            .as_str()
            .ok_or_else(|| HandlerError::new("notice requires a text field"))?;

        let push = Reply::push(
            MSG_NOTICE_PUSH,
            json!({"text": text, "from": identity.principal}),
        );
        let report = self.manager.broadcast(&push);
        metrics::record_broadcast_failures(report.failed.len());

        Ok(json!({"delivered": report.delivered}))
    }
}

/// Assemble the built-in route registrations.
///
/// # Errors
///
/// Returns a configuration error on duplicate message types.
pub fn routes(manager: Arc<ConnectionManager>) -> Result<RouterBuilder, RouterBuildError> {
    MessageRouter::builder()
        .register(Registration::new(MSG_ECHO, Arc::new(EchoHandler)))?
        .register(Registration::new(MSG_WHOAMI, Arc::new(WhoAmIHandler)))?
        .register(Registration::new(MSG_NOTICE, Arc::new(NoticeHandler { manager })).require_role("admin"))
}
