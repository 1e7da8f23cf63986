//! End-to-end tests over a real WebSocket
//!
//! Starts the engine on an ephemeral port and connects agent sessions to it
//! through the WebSocket connector.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tower::ServiceExt;

use fleet_agent::executor::EchoExecutor;
use fleet_agent::{AgentSession, WsConnector};
use fleet_core::config::{EngineConfig, SessionTimings};
use fleet_core::traits::{CommandExecutor, Connector};
use fleet_core::{AgentIdentity, ConnectionError, ConnectionState};
use fleet_engine::auth::KeyStore;
use fleet_engine::{EngineServer, EngineState};
use fleet_protocol::{AgentId, HeartbeatReport, HeartbeatStatus, Message, MAX_MESSAGE_SIZE};

fn fast_timings() -> SessionTimings {
    SessionTimings {
        heartbeat_interval: Duration::from_secs(60),
        announce_grace: Duration::from_millis(10),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(5),
    }
}

/// Start an engine knowing one identity; returns its state and agent URL
async fn start_engine(identity: &AgentIdentity) -> (Arc<EngineState>, String) {
    let keys = KeyStore::new();
    keys.insert(identity);

    let mut config = EngineConfig::default();
    config.bind_address = "127.0.0.1:0".to_string();
    let state = Arc::new(EngineState::with_credentials(config, Arc::new(keys)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/agent", listener.local_addr().unwrap());

    let server = EngineServer::new(Arc::clone(&state));
    tokio::spawn(async move { server.serve(listener).await });

    (state, url)
}

fn session(identity: AgentIdentity, url: &str) -> AgentSession {
    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(url));
    let executor: Arc<dyn CommandExecutor> = Arc::new(EchoExecutor);
    AgentSession::with_system_info(
        identity,
        connector,
        executor,
        fast_timings(),
        Arc::new(|| json!({"test": true})),
    )
}

/// Call an admin route on the running engine's state
async fn admin(state: &Arc<EngineState>, request: Request<Body>) -> (StatusCode, Value) {
    let response = EngineServer::new(Arc::clone(state))
        .router()
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

/// Poll `condition` until it holds, failing after a few seconds
async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_valid_credentials_register_and_heartbeat() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;
    let agent_id = AgentId::new("A1");

    let session = session(identity, &url);
    session.start().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    wait_for("registration", || state.registry.lookup(&agent_id).is_some()).await;
    let connection = state.registry.lookup(&agent_id).unwrap();

    wait_for("first heartbeat", || connection.last_heartbeat_at().is_some()).await;
    let report = connection.last_report().unwrap();
    assert_eq!(report.status, HeartbeatStatus::Online);
    assert_eq!(report.system_info, json!({"test": true}));

    session.stop().await;
    wait_for("unregistration", || state.registry.lookup(&agent_id).is_none()).await;
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_command_round_trip() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;
    let agent_id = AgentId::new("A1");

    let session = session(identity, &url);
    session.start().await.unwrap();
    wait_for("registration", || state.registry.lookup(&agent_id).is_some()).await;

    let pending = state
        .correlator
        .send(&agent_id, json!({"op": "hostname"}))
        .await
        .unwrap();
    let command_id = pending.command_id.clone();
    let result = pending.wait().await.unwrap();

    assert!(result.success);
    assert_eq!(result.command_id, command_id);
    assert_eq!(result.agent_id, agent_id);
    assert_eq!(result.result, json!({"op": "hostname"}));
    assert_eq!(state.correlator.outstanding(), 0);

    session.stop().await;
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_secret_is_rejected_before_upgrade() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;

    let session = session(AgentIdentity::new("A1", "guess"), &url);
    let err = session.start().await.unwrap_err();

    assert_eq!(err, ConnectionError::AuthenticationFailed);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(state.registry.is_empty());
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_agent_is_rejected() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;

    let connector = WsConnector::new(url.as_str());
    let err = connector
        .open(&AgentIdentity::new("A9", "s3cret"))
        .await
        .err()
        .unwrap();

    assert_eq!(err, ConnectionError::AuthenticationFailed);
    assert!(state.registry.is_empty());
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_engine_shutdown_drops_agents_and_agent_retries() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;
    let agent_id = AgentId::new("A1");

    let session = session(identity, &url);
    session.start().await.unwrap();
    wait_for("registration", || state.registry.lookup(&agent_id).is_some()).await;

    state.shutdown.cancel();
    wait_for("unregistration", || state.registry.is_empty()).await;

    let mut states = session.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    wait_for("a reconnect attempt", || session.reconnect_attempts() > 0).await;
    session.stop().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_frame_over_message_limit_keeps_connection() {
    let identity = AgentIdentity::new("A1", "s3cret");
    let (state, url) = start_engine(&identity).await;
    let agent_id = AgentId::new("A1");

    let mut request = url.as_str().into_client_request().unwrap();
    for (name, value) in identity.handshake().headers() {
        request
            .headers_mut()
            .insert(name, HeaderValue::from_str(value).unwrap());
    }
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    wait_for("registration", || state.registry.lookup(&agent_id).is_some()).await;
    let connection = state.registry.lookup(&agent_id).unwrap();

    let oversized = format!(
        r#"{{"type":"pong","agentId":"A1","pad":"{}"}}"#,
        "x".repeat(2 * MAX_MESSAGE_SIZE)
    );
    socket.send(Frame::Text(oversized)).await.unwrap();

    let report = Message::StatusUpdate(HeartbeatReport {
        agent_id: agent_id.clone(),
        timestamp: 1,
        status: HeartbeatStatus::Online,
        system_info: json!({"after": "oversized"}),
    });
    let text = fleet_protocol::encode(&report).unwrap();
    socket.send(Frame::Text(text)).await.unwrap();

    wait_for("heartbeat after oversized frame", || {
        connection.last_heartbeat_at().is_some()
    })
    .await;
    let current = state.registry.lookup(&agent_id).unwrap();
    assert_eq!(current.connection_id, connection.connection_id);
    assert_eq!(
        connection.last_report().unwrap().system_info,
        json!({"after": "oversized"})
    );

    socket.close(None).await.unwrap();
    while socket.next().await.is_some() {}
    wait_for("unregistration", || state.registry.is_empty()).await;
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_keys_issued_and_revoked_on_running_engine() {
    let seed = AgentIdentity::new("seed", "seed");
    let (state, url) = start_engine(&seed).await;

    let (status, body) = admin(
        &state,
        Request::post("/keys").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let identity: AgentIdentity = serde_json::from_value(body).unwrap();
    let agent_id = identity.id.clone();

    let session = session(identity.clone(), &url);
    session.start().await.unwrap();
    wait_for("registration", || state.registry.lookup(&agent_id).is_some()).await;
    let connection = state.registry.lookup(&agent_id).unwrap();

    let (status, _) = admin(
        &state,
        Request::delete(format!("/keys/{}", agent_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Revocation applies at the next authentication only
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(
        state.registry.lookup(&agent_id).unwrap().connection_id,
        connection.connection_id
    );

    let err = WsConnector::new(url.as_str())
        .open(&identity)
        .await
        .err()
        .unwrap();
    assert_eq!(err, ConnectionError::AuthenticationFailed);

    let (status, _) = admin(
        &state,
        Request::delete(format!("/keys/{}", agent_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    session.stop().await;
    state.shutdown.cancel();
}
