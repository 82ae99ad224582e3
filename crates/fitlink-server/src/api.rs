use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use fitlink_shared::ConversationStatus;
use fitlink_store::{
    Conversation, ConversationStats, ConversationSummary, Message, ProfileSummary, ReadReceipt,
};

use crate::auth::{bearer_token, Identity};
use crate::config::ServerConfig;
use crate::directory::Pagination;
use crate::error::ServerError;
use crate::gateway::{socket, Gateway, OutgoingMessage};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/:id/read", post(mark_read))
        .route("/conversations/:id/stats", get(conversation_stats))
        .route("/conversations/:id/status", put(set_status))
        .route("/messages/search", get(search_messages))
        .route("/profile", put(update_profile))
        .route("/ws", get(socket::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    participant_id: String,
}

#[derive(Deserialize)]
struct StatusRequest {
    status: ConversationStatus,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest {
    display_name: Option<String>,
    avatar_url: Option<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Verify the bearer token and make sure the caller has a user row.
async fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Identity, ServerError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ServerError::Authentication("missing bearer token".into()))?;
    let identity = state.gateway.authenticate(token)?;
    state
        .gateway
        .store()
        .ensure_user(&identity.user_id, identity.role)
        .await?;
    Ok(identity)
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let conversation = state
        .gateway
        .directory()
        .open(&identity, req.participant_id.trim())
        .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let conversations = state.gateway.directory().list(&identity, pagination).await?;
    Ok(Json(conversations))
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let (page, limit) = pagination.resolve();
    let messages = state
        .gateway
        .store()
        .list_messages(id, &identity.user_id, page, limit)
        .await?;
    Ok(Json(messages))
}

/// Non-realtime send. Fan-out to joined connections is the same as for a
/// realtime send.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(outgoing): Json<OutgoingMessage>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let message = state.gateway.send_message(&identity, id, outgoing).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ReadReceipt>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let receipt = state.gateway.mark_read(&identity, id).await?;
    Ok(Json(receipt))
}

async fn conversation_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationStats>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let stats = state
        .gateway
        .store()
        .conversation_stats(id, &identity.user_id)
        .await?;
    Ok(Json(stats))
}

async fn set_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let conversation = state
        .gateway
        .store()
        .set_conversation_status(id, &identity.user_id, req.status)
        .await?;

    info!(
        conversation = %id,
        user = %identity.user_id,
        status = %req.status,
        "Conversation status changed"
    );
    Ok(Json(conversation))
}

async fn search_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let (page, limit) = Pagination {
        page: query.page,
        limit: query.limit,
    }
    .resolve();
    let messages = state
        .gateway
        .store()
        .search_messages(&identity.user_id, &query.q, page, limit)
        .await?;
    Ok(Json(messages))
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<ProfileSummary>, ServerError> {
    let identity = authenticate(&headers, &state).await?;
    let profile = state
        .gateway
        .store()
        .update_profile(
            &identity.user_id,
            identity.role,
            req.display_name.as_deref(),
            req.avatar_url.as_deref(),
        )
        .await?;
    Ok(Json(profile))
}

/// Start the HTTP API server.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use fitlink_shared::Role;
    use fitlink_store::{Database, MessageStore};

    use super::*;
    use crate::auth::TokenAuthenticator;
    use crate::gateway::GatewaySettings;
    use crate::notify::LogNotifier;

    const SECRET: &str = "api-test-secret";

    fn app() -> (Router, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("fitlink.db")).unwrap();
        let (store, events) = MessageStore::with_events(db);
        let gateway = Gateway::start(
            store,
            events,
            Arc::new(TokenAuthenticator::new(SECRET.as_bytes())),
            Arc::new(LogNotifier),
            GatewaySettings::default(),
        );
        let state = AppState {
            gateway,
            rate_limiter: RateLimiter::new(100.0, 100.0),
            config: Arc::new(ServerConfig::default()),
        };
        (build_router(state), dir)
    }

    fn token(user: &str, role: Role) -> String {
        TokenAuthenticator::new(SECRET.as_bytes())
            .issue(user, role, chrono::Duration::hours(1))
            .unwrap()
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(bearer) = bearer {
            req = req.header("authorization", format!("Bearer {bearer}"));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = app();
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let (app, _dir) = app();
        let (status, body) = call(&app, Method::GET, "/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "authentication_error");

        let (status, _) =
            call(&app, Method::GET, "/conversations", Some("not-a-token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_conversation_flow() {
        let (app, _dir) = app();
        let client = token("c1", Role::Client);
        let trainer = token("t1", Role::Trainer);

        let (status, conv) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&client),
            Some(json!({ "participantId": "t1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(conv["clientId"], "c1");
        assert_eq!(conv["trainerId"], "t1");
        let id = conv["id"].as_str().unwrap().to_string();

        let (status, msg) = call(
            &app,
            Method::POST,
            &format!("/conversations/{id}/messages"),
            Some(&client),
            Some(json!({ "content": "Hi, interested in training" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(msg["receiverId"], "t1");
        assert_eq!(msg["status"], "sent");

        let (_, listed) = call(&app, Method::GET, "/conversations", Some(&trainer), None).await;
        assert_eq!(listed[0]["unreadCount"], 1);
        assert_eq!(listed[0]["otherParticipant"]["userId"], "c1");

        let (status, receipt) = call(
            &app,
            Method::POST,
            &format!("/conversations/{id}/read"),
            Some(&trainer),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["count"], 1);

        let (_, stats) = call(
            &app,
            Method::GET,
            &format!("/conversations/{id}/stats"),
            Some(&client),
            None,
        )
        .await;
        assert_eq!(stats["totalMessages"], 1);
        assert_eq!(stats["byType"]["text"], 1);
        assert_eq!(stats["trainerUnreadCount"], 0);

        let (_, found) = call(
            &app,
            Method::GET,
            "/messages/search?q=training&page=1&limit=10",
            Some(&trainer),
            None,
        )
        .await;
        assert_eq!(found.as_array().unwrap().len(), 1);

        let (_, messages) = call(
            &app,
            Method::GET,
            &format!("/conversations/{id}/messages?limit=5"),
            Some(&trainer),
            None,
        )
        .await;
        assert_eq!(messages[0]["status"], "read");
    }

    #[tokio::test]
    async fn test_blocked_and_forbidden() {
        let (app, _dir) = app();
        let client = token("c1", Role::Client);
        let trainer = token("t1", Role::Trainer);
        let stranger = token("c2", Role::Client);

        let (_, conv) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&trainer),
            Some(json!({ "participantId": "c1" })),
        )
        .await;
        let id = conv["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/conversations/{id}/messages"),
            Some(&stranger),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/conversations/{id}/status"),
            Some(&trainer),
            Some(json!({ "status": "blocked" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/conversations/{id}/messages"),
            Some(&client),
            Some(json!({ "content": "hello?" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}/stats", Uuid::new_v4()),
            Some(&client),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_profile_shows_in_listing() {
        let (app, _dir) = app();
        let client = token("c1", Role::Client);
        let trainer = token("t1", Role::Trainer);

        let (status, profile) = call(
            &app,
            Method::PUT,
            "/profile",
            Some(&trainer),
            Some(json!({ "displayName": "Coach Sam", "avatarUrl": "https://cdn/x.png" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["displayName"], "Coach Sam");

        call(
            &app,
            Method::POST,
            "/conversations",
            Some(&client),
            Some(json!({ "participantId": "t1" })),
        )
        .await;
        let (_, listed) = call(&app, Method::GET, "/conversations", Some(&client), None).await;
        assert_eq!(listed[0]["otherParticipant"]["displayName"], "Coach Sam");
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (app, _dir) = app();
        let client = token("c1", Role::Client);

        let (status, body) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&client),
            Some(json!({ "participantId": "c1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, _) = call(
            &app,
            Method::GET,
            "/messages/search?q=%20",
            Some(&client),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
