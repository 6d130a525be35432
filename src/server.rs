//! HTTP transport: axum router, request extraction and the panic boundary.

use crate::cors::is_preflight;
use crate::dispatcher::{dispatch, IncomingRequest, MockResponse, RouteTable};
use crate::matcher::parse_query_string;
use crate::state::ServerState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{Map, Value};
use std::any::Any;
use std::convert::Infallible;
use std::sync::Arc;
use tower::{service_fn, Layer, ServiceExt};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Largest request body that will be buffered.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the router serving every request through the dispatcher.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(state): State<Arc<ServerState>>, request: Request<Body>) -> Response {
    if state.is_shutting_down() {
        return MockResponse::shutting_down().into_response();
    }

    // One snapshot per request, so a reload never mixes tables.
    let table = state.route_table();
    let cors = table
        .cors()
        .map(|policy| (policy.layer().clone(), policy.preflight_status()));

    let Some((cors_layer, preflight_status)) = cors else {
        return serve(state, table, request).await;
    };

    let preflight = is_preflight(&request);
    let service = cors_layer.layer(service_fn(move |request: Request<Body>| {
        let state = state.clone();
        let table = table.clone();
        async move { Ok::<_, Infallible>(serve(state, table, request).await) }
    }));

    match service.oneshot(request).await {
        Ok(mut response) => {
            if preflight && response.status() == StatusCode::OK {
                *response.status_mut() = preflight_status;
            }
            response
        }
        Err(never) => match never {},
    }
}

async fn serve(
    state: Arc<ServerState>,
    table: Arc<RouteTable>,
    request: Request<Body>,
) -> Response {
    match read_request(request).await {
        Ok(incoming) => dispatch(&state, &table, incoming).await.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Split a raw request into the parts the dispatcher works with.
async fn read_request(request: Request<Body>) -> Result<IncomingRequest, MockResponse> {
    let (parts, body) = request.into_parts();

    let query = parts.uri.query().map(parse_query_string).unwrap_or_default();
    let headers = lowercase_headers(&parts.headers);

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|err| {
        debug!(error = %err, "Failed to read request body");
        MockResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
    })?;
    let body = parse_body(&parts.headers, &bytes)?;

    Ok(IncomingRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query,
        headers,
        body,
    })
}

/// Header names are already lowercase in `http`; repeated headers are joined.
fn lowercase_headers(headers: &HeaderMap) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    map
}

fn parse_body(headers: &HeaderMap, bytes: &[u8]) -> Result<Option<Value>, MockResponse> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    if content_type.contains("json") {
        serde_json::from_slice(bytes).map(Some).map_err(|err| {
            debug!(error = %err, "Rejecting malformed JSON body");
            MockResponse::error(StatusCode::BAD_REQUEST, "Invalid JSON body")
        })
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let form = String::from_utf8_lossy(bytes);
        Ok(Some(Value::Object(parse_query_string(&form))))
    } else {
        Ok(None)
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = %detail, "Request handler panicked");
    MockResponse::internal_error().into_response()
}
