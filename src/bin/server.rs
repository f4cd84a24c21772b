//! Capwarden REST API Server
//!
//! Run with: cargo run --features server --bin capwarden-server
//!
//! Endpoints:
//!   GET  /status             - Bootstrap state and admin principal
//!   POST /check              - Verify a (principal, resource, action) triple
//!   POST /grant              - Create a capability
//!   POST /revoke             - Revoke a capability and its delegations
//!   POST /delegate           - Delegate a held capability
//!   POST /requests           - File a capability request
//!   POST /requests/approve   - Approve a pending request
//!   POST /requests/reject    - Reject a pending request
//!   POST /groups/grant       - Add a principal to a group
//!   POST /usage/reserve      - Reserve metered usage
//!   POST /usage/commit       - Commit a reservation with the actual amount

use std::net::IpAddr;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use capwarden::{
    ActionSet, CapError, CheckRequest, Conditions, Config, Decision, Engine, NewCapability, NewRequest, Period,
    Principal, Reservation, Reserved, Resource, UsageKey, UsageRecord,
};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
struct CheckReq {
    principal: String,
    resource: String,
    action: String,
    usage_type: Option<String>,
    amount: Option<f64>,
    source_ip: Option<IpAddr>,
}

#[derive(Deserialize)]
struct GrantReq {
    actor: String,
    principal: String,
    resource: String,
    actions: Vec<String>,
    #[serde(default)]
    conditions: Conditions,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct RevokeReq {
    actor: String,
    capability_id: String,
}

#[derive(Deserialize)]
struct DelegateReq {
    actor: String,
    delegatee: String,
    capability_id: String,
}

#[derive(Deserialize)]
struct CreateRequestReq {
    requester: String,
    resource: String,
    actions: Vec<String>,
    owner_id: String,
    message: Option<String>,
    callback: Option<String>,
}

#[derive(Deserialize)]
struct ResolveReq {
    actor: String,
    request_id: String,
    conditions: Option<Conditions>,
}

#[derive(Deserialize)]
struct GroupGrantReq {
    actor: String,
    principal: String,
    group: String,
}

#[derive(Deserialize)]
struct ReserveReq {
    capability_id: String,
    principal: String,
    usage_type: String,
    period: Period,
    amount: f64,
}

#[derive(Deserialize)]
struct CommitReq {
    reservation: Reservation,
    actual: f64,
}

#[derive(Serialize)]
struct StatusRes {
    bootstrapped: bool,
    admin: Option<String>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(msg.into()) }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

// ============================================================================
// Helpers
// ============================================================================

fn status_of(e: &CapError) -> StatusCode {
    match e {
        CapError::Validation(_) => StatusCode::BAD_REQUEST,
        CapError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        CapError::NotFound { .. } => StatusCode::NOT_FOUND,
        CapError::InvalidState(_) => StatusCode::CONFLICT,
        CapError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        CapError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CapError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T>(result: capwarden::Result<T>) -> Reply<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))),
        Err(e) => (status_of(&e), Json(ApiResponse::err(e.to_string()))),
    }
}

fn principal(s: &str) -> capwarden::Result<Principal> {
    s.parse()
}

fn resource(s: &str) -> capwarden::Result<Resource> {
    s.parse()
}

fn status(engine: &Engine) -> capwarden::Result<StatusRes> {
    Ok(StatusRes {
        bootstrapped: engine.is_bootstrapped()?,
        admin: engine.admin_principal()?.map(|p| p.to_string()),
    })
}

fn check(engine: &Engine, req: CheckReq) -> capwarden::Result<Decision> {
    let mut check = CheckRequest::parse(&req.principal, &req.resource, &req.action)?;
    check = match (req.usage_type, req.amount) {
        (Some(t), amount) => check.with_usage(t, amount.unwrap_or(0.0)),
        (None, Some(amount)) => check.with_amount(amount),
        (None, None) => check,
    };
    if let Some(ip) = req.source_ip {
        check = check.from_ip(ip);
    }
    engine.check(&check)
}

fn grant(engine: &Engine, req: GrantReq) -> capwarden::Result<String> {
    let mut new = NewCapability::new(principal(&req.principal)?, resource(&req.resource)?, ActionSet::parse(&req.actions)?)
        .with_conditions(req.conditions);
    new.title = req.title;
    new.description = req.description;
    engine.grant(&principal(&req.actor)?, new)
}

fn file_request(engine: &Engine, req: CreateRequestReq) -> capwarden::Result<String> {
    let mut new = NewRequest::new(principal(&req.requester)?, resource(&req.resource)?, ActionSet::parse(&req.actions)?, req.owner_id);
    new.message = req.message;
    new.callback = req.callback;
    engine.request_capability(new)
}

fn reserve(engine: &Engine, req: ReserveReq) -> capwarden::Result<Reserved> {
    let key = UsageKey::new(req.capability_id, principal(&req.principal)?, req.usage_type);
    engine.check_and_reserve(&key, req.period, req.amount)
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_status(State(engine): State<Engine>) -> Reply<StatusRes> {
    reply(status(&engine))
}

async fn post_check(State(engine): State<Engine>, Json(req): Json<CheckReq>) -> Reply<Decision> {
    reply(check(&engine, req))
}

async fn post_grant(State(engine): State<Engine>, Json(req): Json<GrantReq>) -> Reply<String> {
    reply(grant(&engine, req))
}

async fn post_revoke(State(engine): State<Engine>, Json(req): Json<RevokeReq>) -> Reply<Vec<String>> {
    reply(principal(&req.actor).and_then(|actor| engine.revoke(&actor, &req.capability_id)))
}

async fn post_delegate(State(engine): State<Engine>, Json(req): Json<DelegateReq>) -> Reply<String> {
    reply(principal(&req.actor).and_then(|actor| {
        let delegatee = principal(&req.delegatee)?;
        engine.delegate(&actor, &delegatee, &req.capability_id)
    }))
}

async fn post_request(State(engine): State<Engine>, Json(req): Json<CreateRequestReq>) -> Reply<String> {
    reply(file_request(&engine, req))
}

async fn post_approve(State(engine): State<Engine>, Json(req): Json<ResolveReq>) -> Reply<String> {
    reply(principal(&req.actor).and_then(|actor| engine.approve(&actor, &req.request_id, req.conditions)))
}

async fn post_reject(State(engine): State<Engine>, Json(req): Json<ResolveReq>) -> Reply<()> {
    reply(principal(&req.actor).and_then(|actor| engine.reject(&actor, &req.request_id)))
}

async fn post_group_grant(State(engine): State<Engine>, Json(req): Json<GroupGrantReq>) -> Reply<String> {
    reply(principal(&req.actor).and_then(|actor| {
        let member = principal(&req.principal)?;
        engine.grant_group(&actor, &member, &req.group)
    }))
}

async fn post_reserve(State(engine): State<Engine>, Json(req): Json<ReserveReq>) -> Reply<Reserved> {
    reply(reserve(&engine, req))
}

async fn post_commit(State(engine): State<Engine>, Json(req): Json<CommitReq>) -> Reply<UsageRecord> {
    reply(engine.commit(&req.reservation, req.actual))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    info!(db = %config.db_path.display(), "opening store");
    let engine = Engine::open(config)?;

    // Background sweep of abandoned reservations
    let sweeper = engine.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            if let Err(e) = sweeper.sweep_expired_reservations() {
                tracing::warn!(error = %e, "reservation sweep failed");
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/status", get(get_status))
        .route("/check", post(post_check))
        .route("/grant", post(post_grant))
        .route("/revoke", post(post_revoke))
        .route("/delegate", post(post_delegate))
        .route("/requests", post(post_request))
        .route("/requests/approve", post(post_approve))
        .route("/requests/reject", post(post_reject))
        .route("/groups/grant", post(post_group_grant))
        .route("/usage/reserve", post(post_reserve))
        .route("/usage/commit", post(post_commit))
        .layer(cors)
        .with_state(engine);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());
    let addr = format!("0.0.0.0:{}", port);
    info!(%addr, "capwarden server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
