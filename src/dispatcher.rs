//! Route table and request dispatch.
//!
//! The dispatch pipeline for a request:
//!
//! ```text
//! shutdown check → global headers → security headers → route lookup
//!     → conditions (fallback / 400) → route headers → errorCode
//!     → delay → response rendering
//! ```
//!
//! Every outcome is a JSON [`MockResponse`]; template failures become a
//! generic 500 and never a partial body.

use crate::config::{HttpMethod, RouteSpec, ServerConfig};
use crate::cors::CorsPolicy;
use crate::error::ConfigError;
use crate::matcher::{ConditionMatcher, PathPattern, RequestSections};
use crate::state::ServerState;
use crate::template::{now_millis, RequestContext, TemplateEngine};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ERROR_MESSAGE: &str = "Internal server error";
pub const SHUTTING_DOWN_MESSAGE: &str = "Server is shutting down";

/// Set when one or more global headers failed to render.
pub const HEADER_ERRORS_HEADER: &str = "x-mock-header-errors";

const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
];

/// An incoming request, already parsed by the transport.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub path: String,
    pub query: Map<String, Value>,
    /// Lowercase header names
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
}

impl IncomingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Map::new(),
            headers: Map::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, query: Map<String, Value>) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), Value::String(value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn sections(&self) -> RequestSections<'_> {
        RequestSections {
            query: Some(&self.query),
            headers: Some(&self.headers),
            body: self.body.as_ref(),
        }
    }
}

/// A JSON response produced by the dispatcher.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl MockResponse {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    pub fn internal_error() -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, DEFAULT_ERROR_MESSAGE)
    }

    pub fn shutting_down() -> Self {
        Self::error(StatusCode::SERVICE_UNAVAILABLE, SHUTTING_DOWN_MESSAGE)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Put `base` underneath this response's own headers.
    fn layered_on(mut self, mut base: HeaderMap) -> Self {
        base.extend(self.headers);
        self.headers = base;
        self
    }
}

impl IntoResponse for MockResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        response
    }
}

/// One compiled route.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    method: HttpMethod,
    pattern: PathPattern,
    spec: RouteSpec,
}

impl CompiledRoute {
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn spec(&self) -> &RouteSpec {
        &self.spec
    }
}

/// The active set of routes plus the global response settings.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    global_headers: Vec<(String, String)>,
    cors: Option<CorsPolicy>,
    log_matches: bool,
}

impl RouteTable {
    /// Compile a validated configuration.
    pub fn build(config: &ServerConfig) -> Result<Self, ConfigError> {
        let routes = config
            .routes
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let pattern = PathPattern::parse(&spec.path)
                    .map_err(|e| ConfigError::Invalid(format!("routes[{}].path: {}", i, e)))?;
                Ok(CompiledRoute {
                    method: spec.method,
                    pattern,
                    spec: spec.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mut global_headers: Vec<(String, String)> = config
            .global_headers()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        global_headers.sort();

        let cors = CorsPolicy::from_setting(config.globals.as_ref().and_then(|g| g.cors.as_ref()))?;

        Ok(Self {
            routes,
            global_headers,
            cors,
            log_matches: config.log_matches(),
        })
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn cors(&self) -> Option<&CorsPolicy> {
        self.cors.as_ref()
    }

    /// First route, in declaration order, matching method and path.
    pub fn find(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(&CompiledRoute, Map<String, Value>)> {
        self.routes
            .iter()
            .filter(|route| route.method.matches(method))
            .find_map(|route| route.pattern.matches(path).map(|params| (route, params)))
    }
}

/// Handle one request against a route table snapshot.
pub async fn dispatch(
    state: &ServerState,
    table: &RouteTable,
    request: IncomingRequest,
) -> MockResponse {
    let start_time = now_millis();
    state.stats().record_request();

    if state.is_shutting_down() {
        debug!(method = %request.method, path = %request.path, "Rejecting request during shutdown");
        return MockResponse::shutting_down();
    }

    let engine = state.engine();
    let mut base_headers = resolve_global_headers(engine, &table.global_headers, start_time);
    for (name, value) in SECURITY_HEADERS {
        base_headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }

    let Some((route, params)) = table.find(&request.method, &request.path) else {
        state.stats().record_unmatched();
        warn!(method = %request.method, path = %request.path, "No matching route found");
        return MockResponse::error(StatusCode::NOT_FOUND, "Not Found").layered_on(base_headers);
    };

    state.stats().record_matched();
    if table.log_matches {
        info!(
            route = %route.path(),
            method = %request.method,
            path = %request.path,
            "Request matched route"
        );
    }

    respond(engine, route, &params, &request, start_time)
        .await
        .layered_on(base_headers)
}

async fn respond(
    engine: &TemplateEngine,
    route: &CompiledRoute,
    params: &Map<String, Value>,
    request: &IncomingRequest,
    start_time: i64,
) -> MockResponse {
    let spec = &route.spec;
    let ctx = RequestContext::new()
        .with_path_params(params)
        .with_query(&request.query)
        .with_body(request.body.as_ref())
        .with_headers(&request.headers)
        .with_start_time(start_time);

    if !ConditionMatcher::matches(spec.conditions.as_ref(), &request.sections()) {
        return match &spec.fallback {
            Some(fallback) => render_fallback(engine, route, fallback, &ctx),
            None => {
                debug!(route = %route.path(), "Conditions not met and no fallback configured");
                MockResponse::error(StatusCode::BAD_REQUEST, "Conditions not met")
            }
        };
    }

    let headers = match render_headers(engine, &spec.headers, &ctx) {
        Ok(headers) => headers,
        Err(err) => {
            error!(route = %route.path(), error = %err, "Failed to render route headers");
            return MockResponse::internal_error();
        }
    };

    if let Some(code) = spec.error_code {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = spec.error_message.as_deref().unwrap_or(DEFAULT_ERROR_MESSAGE);
        debug!(route = %route.path(), status = code, "Returning configured error");
        return MockResponse::error(status, message).with_headers(headers);
    }

    if spec.delay > 0 {
        debug!(route = %route.path(), delay_ms = spec.delay, "Applying delay");
        tokio::time::sleep(Duration::from_millis(spec.delay)).await;
    }

    let Some(body) = &spec.response else {
        // Validation guarantees a response when there is no error code.
        return MockResponse::internal_error();
    };

    match engine.render_json(body, &ctx) {
        Ok(rendered) => MockResponse::json(StatusCode::OK, rendered).with_headers(headers),
        Err(err) => {
            error!(
                route = %route.path(),
                location = %err.location,
                error = %err,
                "Failed to render response"
            );
            MockResponse::internal_error()
        }
    }
}

/// A fallback of exactly `{status, body}` sets the status; anything else is
/// a 200 body.
fn render_fallback(
    engine: &TemplateEngine,
    route: &CompiledRoute,
    fallback: &Value,
    ctx: &RequestContext,
) -> MockResponse {
    let (status, body) = match error_style_fallback(fallback) {
        Some((status, body)) => (status, body),
        None => (StatusCode::OK, fallback),
    };

    match engine.render_json(body, ctx) {
        Ok(rendered) => {
            debug!(route = %route.path(), status = status.as_u16(), "Serving fallback");
            MockResponse::json(status, rendered)
        }
        Err(err) => {
            error!(route = %route.path(), error = %err, "Failed to render fallback");
            MockResponse::internal_error()
        }
    }
}

fn error_style_fallback(fallback: &Value) -> Option<(StatusCode, &Value)> {
    let fields = fallback.as_object()?;
    if fields.len() != 2 {
        return None;
    }
    let status = fields
        .get("status")?
        .as_u64()
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (100..=599).contains(s))
        .and_then(|s| StatusCode::from_u16(s).ok())?;
    Some((status, fields.get("body")?))
}

/// Render global headers against timing data only.
///
/// A failing header is logged and skipped; the failure count is reported in
/// [`HEADER_ERRORS_HEADER`].
fn resolve_global_headers(
    engine: &TemplateEngine,
    headers: &[(String, String)],
    start_time: i64,
) -> HeaderMap {
    let mut resolved = HeaderMap::new();
    if headers.is_empty() {
        return resolved;
    }

    let ctx = RequestContext::new().with_start_time(start_time);
    let mut failures = 0usize;

    for (name, template) in headers {
        match render_header(engine, name, template, &ctx) {
            Ok((name, value)) => {
                resolved.insert(name, value);
            }
            Err(err) => {
                failures += 1;
                warn!(header = %name, error = %err, "Skipping global header");
            }
        }
    }

    if failures > 0 {
        resolved.insert(HeaderName::from_static(HEADER_ERRORS_HEADER), HeaderValue::from(failures));
    }
    resolved
}

/// Render route headers; any failure fails the whole set.
fn render_headers(
    engine: &TemplateEngine,
    headers: &std::collections::HashMap<String, String>,
    ctx: &RequestContext,
) -> Result<HeaderMap, String> {
    let mut rendered = HeaderMap::new();
    for (name, template) in headers {
        let (name, value) = render_header(engine, name, template, ctx)?;
        rendered.insert(name, value);
    }
    Ok(rendered)
}

fn render_header(
    engine: &TemplateEngine,
    name: &str,
    template: &str,
    ctx: &RequestContext,
) -> Result<(HeaderName, HeaderValue), String> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| format!("invalid header name `{}`", name))?;

    let value = if TemplateEngine::is_template(template) {
        engine
            .render(template, ctx)
            .map_err(|e| e.at(format!("headers.{}", name)).to_string())?
    } else {
        template.to_string()
    };

    let header_value = HeaderValue::from_str(&value)
        .map_err(|_| format!("invalid value for header `{}`", name))?;
    Ok((header_name, header_value))
}
