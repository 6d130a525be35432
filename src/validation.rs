//! Structural checks on a raw configuration document.
//!
//! Runs before the document is deserialized so that errors name the
//! offending location (`routes[3].errorCode`) rather than a serde position.
//! Validation is fail-fast: the first violation is returned.

use crate::config::HttpMethod;
use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::time::Duration;

/// Keys accepted in a CORS options object.
pub const CORS_KEYS: [&str; 8] = [
    "origin",
    "methods",
    "allowedHeaders",
    "exposedHeaders",
    "credentials",
    "maxAge",
    "preflightContinue",
    "optionsSuccessStatus",
];

/// Keys accepted in a route's `conditions`.
pub const CONDITION_KEYS: [&str; 3] = ["query", "headers", "body"];

const GLOBAL_KEYS: [&str; 3] = ["headers", "cors", "logMatches"];

/// Validate a configuration document.
pub fn validate(doc: &Value) -> Result<(), ConfigError> {
    let doc = doc
        .as_object()
        .ok_or_else(|| ConfigError::invalid("config must be a JSON object"))?;

    let routes = match doc.get("routes") {
        None | Some(Value::Null) => return Err(ConfigError::invalid("missing `routes`")),
        Some(Value::Array(routes)) => routes,
        Some(_) => return Err(ConfigError::invalid("`routes` must be an array")),
    };
    if routes.is_empty() {
        return Err(ConfigError::invalid("`routes` must not be empty"));
    }

    if let Some(globals) = doc.get("globals") {
        validate_globals(globals)?;
    }

    for (i, route) in routes.iter().enumerate() {
        validate_route(route).map_err(|msg| ConfigError::Invalid(format!("routes[{}]{}", i, msg)))?;
    }

    Ok(())
}

fn validate_globals(globals: &Value) -> Result<(), ConfigError> {
    let globals = match globals {
        Value::Null => return Ok(()),
        Value::Object(g) => g,
        _ => return Err(ConfigError::invalid("`globals` must be an object")),
    };

    if let Some(key) = globals.keys().find(|k| !GLOBAL_KEYS.contains(&k.as_str())) {
        return Err(ConfigError::Invalid(format!("unknown key `globals.{}`", key)));
    }

    if let Some(headers) = globals.get("headers") {
        check_header_map(headers)
            .map_err(|msg| ConfigError::Invalid(format!("globals.headers{}", msg)))?;
    }

    match globals.get("logMatches") {
        None | Some(Value::Bool(_)) => {}
        Some(_) => return Err(ConfigError::invalid("`globals.logMatches` must be a boolean")),
    }

    match globals.get("cors") {
        None | Some(Value::Null) | Some(Value::Bool(_)) => Ok(()),
        Some(Value::Object(opts)) => validate_cors(opts),
        Some(_) => Err(ConfigError::invalid(
            "`globals.cors` must be a boolean or an options object",
        )),
    }
}

fn validate_cors(opts: &Map<String, Value>) -> Result<(), ConfigError> {
    if let Some(key) = opts.keys().find(|k| !CORS_KEYS.contains(&k.as_str())) {
        return Err(ConfigError::Invalid(format!(
            "unknown CORS option `{}` (allowed: {})",
            key,
            CORS_KEYS.join(", ")
        )));
    }

    let invalid = |key: &str, expected: &str| {
        ConfigError::Invalid(format!("CORS option `{}` must be {}", key, expected))
    };

    if let Some(origin) = opts.get("origin") {
        if !(origin.is_boolean() || is_string_or_string_array(origin)) {
            return Err(invalid("origin", "a boolean, string or array of strings"));
        }
    }
    for key in ["methods", "allowedHeaders", "exposedHeaders"] {
        if let Some(v) = opts.get(key) {
            if !is_string_or_string_array(v) {
                return Err(invalid(key, "a string or array of strings"));
            }
        }
    }
    if let Some(v) = opts.get("maxAge") {
        if !v.as_f64().is_some_and(|n| Duration::try_from_secs_f64(n).is_ok()) {
            return Err(invalid("maxAge", "a non-negative number of seconds in range"));
        }
    }
    for key in ["credentials", "preflightContinue"] {
        if let Some(v) = opts.get(key) {
            if !v.is_boolean() {
                return Err(invalid(key, "a boolean"));
            }
        }
    }
    if let Some(v) = opts.get("optionsSuccessStatus") {
        if !as_integer(v).is_some_and(|n| (200..=299).contains(&n)) {
            return Err(invalid("optionsSuccessStatus", "a 2xx integer status"));
        }
    }

    Ok(())
}

/// Returns the error suffix (appended to `routes[i]`) on failure.
fn validate_route(route: &Value) -> Result<(), String> {
    let route = route.as_object().ok_or(": route must be an object")?;

    let method = non_empty_str(route, "method").ok_or(": missing `method`")?;
    method
        .parse::<HttpMethod>()
        .map_err(|e| format!(".method: {}", e))?;

    let path = non_empty_str(route, "path").ok_or(": missing `path`")?;
    if !path.starts_with('/') {
        return Err(format!(".path: `{}` must start with `/`", path));
    }

    let has_response = route.get("response").is_some_and(|v| !v.is_null());
    let has_error_code = route.get("errorCode").is_some_and(|v| !v.is_null());
    if !has_response && !has_error_code {
        return Err(": must define `response` or `errorCode`".to_string());
    }

    if let Some(conditions) = route.get("conditions") {
        validate_conditions(conditions)?;
    }

    if has_error_code {
        let code = &route["errorCode"];
        if !as_integer(code).is_some_and(|c| (400..=599).contains(&c)) {
            return Err(format!(
                ".errorCode: `{}` must be an integer between 400 and 599",
                code
            ));
        }
    }

    match route.get("errorMessage") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => return Err(".errorMessage: must be a string".to_string()),
    }

    if let Some(delay) = route.get("delay") {
        if !delay.as_f64().is_some_and(|d| d >= 0.0) {
            return Err(format!(".delay: `{}` must be a number >= 0", delay));
        }
    }

    if let Some(headers) = route.get("headers") {
        check_header_map(headers).map_err(|msg| format!(".headers{}", msg))?;
    }

    Ok(())
}

fn validate_conditions(conditions: &Value) -> Result<(), String> {
    let conditions = match conditions {
        Value::Null => return Ok(()),
        Value::Object(c) => c,
        _ => return Err(".conditions: must be an object".to_string()),
    };

    for (key, section) in conditions {
        if !CONDITION_KEYS.contains(&key.as_str()) {
            return Err(format!(
                ".conditions: invalid key `{}` (allowed: query, headers, body)",
                key
            ));
        }
        if !(section.is_object() || section.is_null()) {
            return Err(format!(".conditions.{}: must be an object", key));
        }
    }

    Ok(())
}

fn check_header_map(headers: &Value) -> Result<(), String> {
    let headers = headers.as_object().ok_or(": must be an object")?;
    match headers.iter().find(|(_, v)| !v.is_string()) {
        Some((name, _)) => Err(format!(".{}: header value must be a string", name)),
        None => Ok(()),
    }
}

/// Non-negative integers, including floats without a fractional part (`500.0`).
fn as_integer(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.fract() == 0.0 && *n >= 0.0 && *n <= u64::MAX as f64)
            .map(|n| n as u64)
    })
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn is_string_or_string_array(value: &Value) -> bool {
    match value {
        Value::String(_) => true,
        Value::Array(items) => items.iter().all(Value::is_string),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_route(route: Value) -> Value {
        json!({ "routes": [route] })
    }

    fn message(doc: Value) -> String {
        match validate(&doc) {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("Expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_document() {
        let doc = json!({
            "routes": [
                {
                    "method": "GET",
                    "path": "/users/:id",
                    "response": { "id": "{{id}}" },
                    "delay": 20
                },
                { "method": "post", "path": "/fail", "errorCode": 500 },
                {
                    "method": "GET",
                    "path": "/plan",
                    "response": { "msg": "A" },
                    "conditions": {
                        "query": { "type": "premium" },
                        "headers": {},
                        "body": { "a": { "b": 1 } }
                    },
                    "fallback": { "msg": "B" }
                }
            ],
            "globals": {
                "headers": { "X-Mock": "true" },
                "cors": {
                    "origin": "*",
                    "methods": ["GET", "POST"],
                    "allowedHeaders": "Content-Type",
                    "exposedHeaders": ["X-Total"],
                    "credentials": false,
                    "maxAge": 3600,
                    "preflightContinue": false,
                    "optionsSuccessStatus": 204
                }
            }
        });
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn test_rejects_missing_routes() {
        assert!(message(json!({})).contains("missing `routes`"));
        assert!(message(json!({ "routes": {} })).contains("must be an array"));
        assert!(message(json!({ "routes": [] })).contains("must not be empty"));
        assert!(message(json!([])).contains("JSON object"));
    }

    #[test]
    fn test_rejects_missing_method_or_path() {
        let msg = message(with_route(json!({ "path": "/a", "response": {} })));
        assert_eq!(msg, "routes[0]: missing `method`");

        let msg = message(with_route(json!({ "method": "GET", "path": "", "response": {} })));
        assert_eq!(msg, "routes[0]: missing `path`");

        let msg = message(with_route(json!({ "method": "GET", "path": "a", "response": {} })));
        assert!(msg.contains("must start with `/`"));
    }

    #[test]
    fn test_rejects_unknown_method() {
        let msg = message(with_route(json!({ "method": "TRACE", "path": "/", "response": {} })));
        assert!(msg.contains("unsupported method"));
    }

    #[test]
    fn test_requires_response_or_error_code() {
        let msg = message(with_route(json!({ "method": "GET", "path": "/" })));
        assert!(msg.contains("`response` or `errorCode`"));

        let msg = message(with_route(json!({ "method": "GET", "path": "/", "response": null })));
        assert!(msg.contains("`response` or `errorCode`"));
    }

    #[test]
    fn test_rejects_error_code_out_of_range() {
        for code in [json!(399), json!(600), json!(200), json!(450.5), json!("500")] {
            let route = json!({ "method": "GET", "path": "/", "errorCode": code });
            let msg = message(with_route(route));
            assert!(msg.starts_with("routes[0].errorCode"), "{}", msg);
        }
        for code in [json!(400), json!(599), json!(500.0)] {
            let route = json!({ "method": "GET", "path": "/", "errorCode": code });
            assert!(validate(&with_route(route)).is_ok());
        }
    }

    #[test]
    fn test_rejects_max_age_out_of_range() {
        let doc = json!({
            "routes": [{ "method": "GET", "path": "/", "response": {} }],
            "globals": { "cors": { "maxAge": 1e20 } }
        });
        assert!(message(doc).contains("maxAge"));
    }

    #[test]
    fn test_rejects_negative_delay() {
        for delay in [json!(-1), json!("10")] {
            let route = json!({ "method": "GET", "path": "/", "response": 1, "delay": delay });
            let msg = message(with_route(route));
            assert!(msg.starts_with("routes[0].delay"));
        }
    }

    #[test]
    fn test_rejects_unknown_condition_key() {
        let msg = message(with_route(json!({
            "method": "GET",
            "path": "/",
            "response": {},
            "conditions": { "cookies": { "a": "b" } }
        })));
        assert!(msg.contains("invalid key `cookies`"));

        let msg = message(with_route(json!({
            "method": "GET",
            "path": "/",
            "response": {},
            "conditions": { "query": "type=premium" }
        })));
        assert!(msg.contains("conditions.query"));
    }

    #[test]
    fn test_rejects_unknown_cors_key() {
        let doc = json!({
            "routes": [{ "method": "GET", "path": "/", "response": {} }],
            "globals": { "cors": { "origin": "*", "allowCredentials": true } }
        });
        assert!(message(doc).contains("unknown CORS option `allowCredentials`"));
    }

    #[test]
    fn test_rejects_mistyped_cors_options() {
        let cases = [
            json!({ "methods": 5 }),
            json!({ "allowedHeaders": [1, 2] }),
            json!({ "maxAge": "60" }),
            json!({ "credentials": "yes" }),
            json!({ "optionsSuccessStatus": 404 }),
            json!({ "origin": 42 }),
        ];
        for cors in cases {
            let doc = json!({
                "routes": [{ "method": "GET", "path": "/", "response": {} }],
                "globals": { "cors": cors }
            });
            assert!(message(doc).starts_with("CORS option"));
        }
    }

    #[test]
    fn test_rejects_non_string_header_values() {
        let msg = message(with_route(json!({
            "method": "GET",
            "path": "/",
            "response": {},
            "headers": { "X-Count": 3 }
        })));
        assert_eq!(msg, "routes[0].headers.X-Count: header value must be a string");
    }

    #[test]
    fn test_reports_route_index() {
        let doc = json!({
            "routes": [
                { "method": "GET", "path": "/ok", "response": {} },
                { "method": "GET", "path": "/bad", "response": {}, "delay": -5 }
            ]
        });
        assert!(message(doc).starts_with("routes[1]"));
    }
}
