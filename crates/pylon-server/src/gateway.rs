//! Connection gateway.
//!
//! Owns the per-connection lifecycle:
//! CONNECTING → AUTHENTICATED → ADMITTED → OPEN → CLOSING → CLOSED.
//!
//! Authentication resolves the handshake credential through the identity
//! provider's circuit breaker; admission claims a connection slot in the
//! shared store. In OPEN, each inbound envelope passes a message-scope rate
//! check before dispatch, and a single rate breach closes the whole
//! connection with the policy-violation code. The admission slot is
//! released on every exit path.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pylon_core::{
    BreakerError, CircuitBreaker, ConnectionId, ConnectionManager, Identity, IdentityError,
    IdentityProvider, MessageRouter, Quota, RateLimiter,
};
use pylon_protocol::{codec, Envelope, Reply, StatusCode, POLICY_VIOLATION};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Rate scope applied to inbound messages.
const MESSAGE_SCOPE: &str = "message";

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The message router (write-once registry).
    pub router: MessageRouter,
    /// Live connection set.
    pub manager: Arc<ConnectionManager>,
    /// Rate limiting and connection admission.
    pub limiter: RateLimiter,
    /// External identity provider.
    pub identity_provider: Arc<dyn IdentityProvider>,
    /// Breaker guarding identity resolution.
    pub identity_breaker: CircuitBreaker,
    /// Quota for the message scope.
    pub message_quota: Quota,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Pylon gateway listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.manager.connection_count(),
    }))
}

/// WebSocket upgrade handler.
///
/// The credential rides on the upgrade request as the `token` query
/// parameter; that HTTP exchange is the connection handshake.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_connection(socket, state, token))
}

/// Drive one connection through its lifecycle.
async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    // CONNECTING → AUTHENTICATED
    let identity = match authenticate(&state, token.as_deref()).await {
        Ok(identity) => identity,
        Err(reason) => {
            metrics::record_rejection(reason);
            debug!(connection = %connection_id, reason, "Connection rejected");
            close_policy_violation(&mut socket, "authentication failed").await;
            return;
        }
    };

    // AUTHENTICATED → ADMITTED
    if !state
        .limiter
        .try_admit(&identity.principal, connection_id.as_str())
        .await
    {
        metrics::record_rejection("admission");
        close_policy_violation(&mut socket, "connection limit exceeded").await;
        return;
    }

    // ADMITTED → OPEN
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state
        .manager
        .register(connection_id.clone(), identity.clone(), outbound_tx);
    debug!(
        connection = %connection_id,
        principal = %identity.principal,
        "Connection open"
    );

    serve_connection(socket, &state, &identity, &connection_id, outbound_rx).await;

    // CLOSING → CLOSED. The admission slot is released on every exit path
    // out of the message loop, including protocol errors.
    state.manager.remove(&connection_id);
    state
        .limiter
        .release(&identity.principal, connection_id.as_str())
        .await;
    debug!(connection = %connection_id, "Connection closed");
}

/// Resolve the handshake credential through the identity breaker.
///
/// The returned reason is the metrics/rejection label; the client only
/// ever sees the policy-violation close code.
async fn authenticate(state: &AppState, credential: Option<&str>) -> Result<Identity, &'static str> {
    let Some(credential) = credential else {
        return Err("missing_credential");
    };

    let result = state
        .identity_breaker
        .call(|| state.identity_provider.resolve(credential))
        .await;

    match result {
        Ok(identity) => Ok(identity),
        Err(BreakerError::Open) => {
            metrics::record_breaker_open("identity-provider");
            Err("identity_unavailable")
        }
        Err(BreakerError::Timeout) => Err("identity_unavailable"),
        Err(BreakerError::Inner(IdentityError::InvalidCredential)) => Err("invalid_credential"),
        Err(BreakerError::Inner(IdentityError::Unavailable(_))) => Err("identity_unavailable"),
    }
}

/// Outcome of processing one inbound envelope.
enum Outcome {
    /// Send this reply and keep the connection open.
    Reply(Reply),
    /// Rate limit breached; close the connection.
    RateLimited,
}

/// Rate-check and dispatch one envelope.
async fn handle_envelope(state: &AppState, identity: &Identity, envelope: &Envelope) -> Outcome {
    let key = RateLimiter::scope_key(MESSAGE_SCOPE, &identity.principal);
    let decision = state.limiter.check_and_record(&key, &state.message_quota).await;
    if !decision.allowed {
        return Outcome::RateLimited;
    }

    let start = Instant::now();
    let reply = state.router.dispatch(identity, envelope).await;
    metrics::record_dispatch(status_label(reply.status_code));
    metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
    Outcome::Reply(reply)
}

fn status_label(code: StatusCode) -> &'static str {
    match code {
        StatusCode::Ok => "ok",
        StatusCode::Error => "error",
        StatusCode::InvalidData => "invalid_data",
        StatusCode::PermissionDenied => "permission_denied",
    }
}

/// Message-processing loop for an OPEN connection.
///
/// Envelopes from one connection are decoded and dispatched strictly in
/// arrival order; unsolicited pushes interleave between requests but never
/// preempt an in-flight dispatch.
async fn serve_connection(
    socket: WebSocket,
    state: &AppState,
    identity: &Identity,
    connection_id: &ConnectionId,
    mut outbound_rx: mpsc::UnboundedReceiver<bytes::Bytes>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    'session: loop {
        tokio::select! {
            biased;

            // Broadcasts and targeted pushes from the connection manager.
            Some(payload) = outbound_rx.recv() => {
                if sender.send(Message::Binary(payload.to_vec())).await.is_err() {
                    break 'session;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let envelope = match codec::decode_from::<Envelope>(&mut read_buffer) {
                                Ok(Some(envelope)) => envelope,
                                // Wait for the rest of the frame.
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(connection = %connection_id, error = %err, "Protocol error");
                                    break 'session;
                                }
                            };

                            match handle_envelope(state, identity, &envelope).await {
                                Outcome::Reply(reply) => {
                                    if send_reply(&mut sender, &reply).await.is_err() {
                                        break 'session;
                                    }
                                }
                                Outcome::RateLimited => {
                                    metrics::record_rejection("message_rate");
                                    warn!(
                                        connection = %connection_id,
                                        principal = %identity.principal,
                                        "Message rate exceeded, closing connection"
                                    );
                                    close_sink_policy_violation(&mut sender, "message rate exceeded").await;
                                    break 'session;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break 'session;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break 'session;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        break 'session;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break 'session;
                    }
                }
            }
        }
    }
}

/// Encode and send a reply.
async fn send_reply(sender: &mut SplitSink<WebSocket, Message>, reply: &Reply) -> Result<()> {
    let data = codec::encode(reply)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Close an unsplit socket with the policy-violation code.
async fn close_policy_violation(socket: &mut WebSocket, reason: &'static str) {
    let frame = CloseFrame {
        code: POLICY_VIOLATION,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Close a split sink with the policy-violation code.
async fn close_sink_policy_violation(sender: &mut SplitSink<WebSocket, Message>, reason: &'static str) {
    let frame = CloseFrame {
        code: POLICY_VIOLATION,
        reason: reason.into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevIdentityProvider;
    use async_trait::async_trait;
    use pylon_core::{
        BreakerConfig, FailurePolicy, LimiterConfig, MemoryStore, NoopValidator,
    };
    use std::time::Duration;

    fn test_state(provider: Arc<dyn IdentityProvider>, message_limit: u32) -> AppState {
        let store = Arc::new(MemoryStore::new());
        let store_breaker = Arc::new(CircuitBreaker::new("shared-store", BreakerConfig::default()));
        let limiter = RateLimiter::new(
            store,
            store_breaker,
            LimiterConfig {
                policy: FailurePolicy::Open,
                max_connections_per_identity: 2,
            },
        );

        AppState {
            config: Config::default(),
            router: MessageRouter::builder().build(Arc::new(NoopValidator)),
            manager: Arc::new(ConnectionManager::new()),
            limiter,
            identity_provider: provider,
            identity_breaker: CircuitBreaker::new(
                "identity-provider",
                BreakerConfig {
                    fail_max: 1,
                    recovery_timeout: Duration::from_secs(60),
                    call_timeout: Duration::from_millis(200),
                },
            ),
            message_quota: Quota::new(message_limit, Duration::from_secs(60)),
        }
    }

    struct DownProvider;

    #[async_trait]
    impl IdentityProvider for DownProvider {
        async fn resolve(&self, _credential: &str) -> Result<Identity, IdentityError> {
            Err(IdentityError::Unavailable("dns failure".into()))
        }
    }

    #[tokio::test]
    async fn test_authenticate_resolves_roles() {
        let state = test_state(Arc::new(DevIdentityProvider), 10);

        let identity = authenticate(&state, Some("alice:admin")).await.unwrap();
        assert_eq!(identity.principal, "alice");
        assert!(identity.roles.contains("admin"));
    }

    #[tokio::test]
    async fn test_authenticate_rejects_missing_and_invalid() {
        let state = test_state(Arc::new(DevIdentityProvider), 10);

        assert_eq!(authenticate(&state, None).await.unwrap_err(), "missing_credential");
        assert_eq!(
            authenticate(&state, Some("")).await.unwrap_err(),
            "invalid_credential"
        );
    }

    #[tokio::test]
    async fn test_authenticate_when_provider_down() {
        let state = test_state(Arc::new(DownProvider), 10);

        // First failure trips the breaker (fail_max = 1)...
        assert_eq!(
            authenticate(&state, Some("alice")).await.unwrap_err(),
            "identity_unavailable"
        );
        // ...and subsequent attempts are short-circuited.
        assert_eq!(
            authenticate(&state, Some("alice")).await.unwrap_err(),
            "identity_unavailable"
        );
        assert_eq!(
            state.identity_breaker.state(),
            pylon_core::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_rate_breach_requests_close() {
        let state = test_state(Arc::new(DevIdentityProvider), 1);
        let identity = Identity::new("u1", std::iter::empty());
        let envelope = Envelope::new(99, "r1", serde_json::json!({}));

        // First message is within quota (unknown type still counts and replies).
        let first = handle_envelope(&state, &identity, &envelope).await;
        match first {
            Outcome::Reply(reply) => {
                assert_eq!(reply.status_code, StatusCode::InvalidData);
                assert_eq!(reply.request_id, "r1");
            }
            Outcome::RateLimited => panic!("first message should be admitted"),
        }

        // Second message breaches the quota and closes the connection.
        assert!(matches!(
            handle_envelope(&state, &identity, &envelope).await,
            Outcome::RateLimited
        ));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(status_label(StatusCode::Ok), "ok");
        assert_eq!(status_label(StatusCode::PermissionDenied), "permission_denied");
    }
}
