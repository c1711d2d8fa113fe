use crate::dns::cache::RecordCache;
use crate::dns::resolver::{Resolver, Transport};
use crate::stats::Stats;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hickory_proto::op::{Message, MessageType, OpCode, Query as DnsQuery};
use hickory_proto::rr::{Name, RecordType};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct ApiState {
    cache: Arc<RecordCache>,
    stats: Arc<Stats>,
    /// Resolver pointed at our own DNS listener, for end-to-end probes.
    local: Arc<Resolver>,
}

/// Admin/observability surface: cache inspection, end-to-end probes, stats,
/// and the filter on/off switch. Serves in the background; only the bind is
/// fatal.
pub async fn serve(
    addr: SocketAddr,
    dns_addr: SocketAddr,
    cache: Arc<RecordCache>,
    stats: Arc<Stats>,
) -> anyhow::Result<()> {
    let probe_addr = SocketAddr::new([127, 0, 0, 1].into(), dns_addr.port());
    let local = Arc::new(Resolver::with_upstreams(
        vec![probe_addr],
        Duration::from_secs(5),
        Duration::ZERO,
        None,
    ));
    let state = ApiState {
        cache,
        stats,
        local,
    };

    let app = Router::new()
        .route("/cache", get(dump_cache))
        .route("/cache/get/{key}", get(cache_get))
        .route("/cache/length", get(cache_length))
        .route("/query/{key}", get(query_key))
        .route("/stats", get(stats_snapshot))
        .route("/application/active", get(active_get).put(active_set))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "api server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "api server terminated");
        }
    });
    Ok(())
}

async fn dump_cache(State(state): State<ApiState>) -> impl IntoResponse {
    // dump() is already a JSON document
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.cache.dump(),
    )
}

async fn cache_get(State(state): State<ApiState>, Path(key): Path<String>) -> impl IntoResponse {
    match state.cache.get(&key) {
        Ok(record) => Json(json!({ "answer": answers(record.msg()) })),
        Err(_) => Json(json!({ "error": format!("{key} not found") })),
    }
}

async fn cache_length(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "length": state.cache.len() }))
}

/// Resolve the key through the proxy itself and report both the live answer
/// and what the cache holds.
async fn query_key(State(state): State<ApiState>, Path(key): Path<String>) -> impl IntoResponse {
    let resolved = match probe(&state.local, &key).await {
        Some(reply) => json!(answers(&reply)),
        None => json!(format!("failed to resolve {key}")),
    };
    let cached = match state.cache.get(&key) {
        Ok(record) => json!(answers(record.msg())),
        Err(_) => json!(format!("{key} not in cache")),
    };
    Json(json!({ "query": resolved, "cache": cached }))
}

async fn probe(resolver: &Resolver, key: &str) -> Option<Message> {
    let name = Name::from_ascii(format!("{key}.")).ok()?;
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(DnsQuery::query(name, RecordType::A));
    resolver.resolve(Transport::Udp, &msg).await.ok()
}

fn answers(msg: &Message) -> Vec<String> {
    msg.answers().iter().map(|rr| rr.to_string()).collect()
}

async fn stats_snapshot(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "stats": state.stats.snapshot() }))
}

async fn active_get(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "active": state.stats.active() }))
}

#[derive(Deserialize)]
struct ActiveParams {
    state: String,
    v: String,
}

async fn active_set(
    State(state): State<ApiState>,
    Query(params): Query<ActiveParams>,
) -> impl IntoResponse {
    if params.v != "1" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "illegal value for 'v'" })),
        );
    }
    match params.state.as_str() {
        "On" => state.stats.activate(),
        "Off" => state.stats.deactivate(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "illegal value for 'state'" })),
            )
        }
    }
    (StatusCode::OK, Json(json!({ "active": state.stats.active() })))
}
