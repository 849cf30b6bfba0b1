use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use demogate_protocol::RejectReason;
use libdemogate::{Allow, Broker};
use serde::Deserialize;
use serde_json::json;

use crate::gateway::remote_addr;

/// Cookie carrying the session token to the reverse proxy.
pub const SESSION_COOKIE: &str = "demo_session";

/// Response header identifying the session for downstream logging.
const SESSION_HEADER: &str = "x-demogate-session";

fn session_cookie_value(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// GET /api/status - queue snapshot for the landing page.
pub async fn status(State(broker): State<Arc<Broker>>) -> Json<serde_json::Value> {
    let (queue_size, session_active) = broker.status_snapshot().await;
    Json(json!({
        "queue_size": queue_size,
        "session_active": session_active,
    }))
}

/// GET /api/session/validate - reverse-proxy auth check. 200 when the
/// session cookie resolves to a live token minted for this address.
pub async fn session_validate(
    State(broker): State<Arc<Broker>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let addr = remote_addr(&headers, peer);
    let Some(token) = session_cookie_value(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match broker.tokens.authorize(&token, &addr).await {
        Some(session_id) => ([(SESSION_HEADER, session_id)], StatusCode::OK).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[derive(Deserialize)]
pub struct CookieRequest {
    token: String,
}

/// POST /api/session/cookie - set the session cookie after verifying
/// the token belongs to this address. Rate-limited per address.
pub async fn cookie_set(
    State(broker): State<Arc<Broker>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CookieRequest>,
) -> Response {
    let addr = remote_addr(&headers, peer);
    let allow = broker
        .limits
        .cookie_requests
        .lock()
        .expect("limiter poisoned")
        .allow(&addr);
    if let Allow::Limited { retry_after } = allow {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
            "too many cookie requests",
        )
            .into_response();
    }

    if broker.tokens.authorize(&body.token, &addr).await.is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // Bounded lifetime: the session plus its reconnect grace.
    let max_age =
        broker.cfg.session_timeout().as_secs() + broker.cfg.disconnect_grace().as_secs();
    let mut cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}",
        body.token
    );
    if broker.cfg.cookie_secure {
        cookie.push_str("; Secure");
    }
    ([(header::SET_COOKIE, cookie)], Json(json!({ "ok": true }))).into_response()
}

#[derive(Deserialize)]
pub struct InviteQuery {
    token: Option<String>,
}

/// GET /api/invite/validate - invite pre-check for the landing page.
/// Token from the query string or the x-invite-token header.
pub async fn invite_validate(
    State(broker): State<Arc<Broker>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<InviteQuery>,
) -> Response {
    let addr = remote_addr(&headers, peer);
    let token = query.token.or_else(|| {
        headers
            .get("x-invite-token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    match broker.invites.validate(token.as_deref(), &addr).await {
        Ok(_) => Json(json!({ "valid": true })).into_response(),
        Err(reason) => {
            let status = match reason {
                RejectReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::UNAUTHORIZED,
            };
            (
                status,
                Json(json!({
                    "valid": false,
                    "reason": reason,
                    "message": reason.message(),
                })),
            )
                .into_response()
        }
    }
}
