//! Configuration for the mock server.
//!
//! Defines the route list, global response headers and CORS settings.
//! Documents are validated as raw JSON (see [`crate::validation`]) before
//! they are deserialized into these types.

use crate::error::ConfigError;
use crate::validation;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Main configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Configured endpoints, matched in declaration order
    pub routes: Vec<RouteSpec>,

    /// Settings applied to every response
    #[serde(default)]
    pub globals: Option<GlobalConfig>,
}

impl ServerConfig {
    /// Load, validate and parse a config file.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, everything else
    /// as JSON.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let format = ConfigFormat::from_path(path);
        Self::parse(&content, format)
    }

    /// Validate and parse a document held in memory.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let doc: Value = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        };
        Self::from_value(doc)
    }

    /// Validate a raw document and convert it into a typed config.
    pub fn from_value(doc: Value) -> Result<Self, ConfigError> {
        validation::validate(&doc)?;
        Ok(serde_json::from_value(doc)?)
    }

    /// Global headers, empty when not configured.
    pub fn global_headers(&self) -> impl Iterator<Item = (&String, &String)> {
        self.globals.iter().flat_map(|g| g.headers.iter())
    }

    /// Whether matched routes are logged at info level.
    pub fn log_matches(&self) -> bool {
        self.globals.as_ref().map_or(true, |g| g.log_matches)
    }
}

/// On-disk document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

/// A single configured endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// HTTP method (case-insensitive in the document)
    pub method: HttpMethod,

    /// Path pattern, e.g. `/users/:id`
    pub path: String,

    /// Response body; every string leaf is a template
    #[serde(default)]
    pub response: Option<Value>,

    /// Route-specific response headers (templated)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Latency to simulate, in milliseconds
    #[serde(default, deserialize_with = "millis")]
    pub delay: u64,

    /// Short-circuit with this status
    #[serde(default, deserialize_with = "status_code")]
    pub error_code: Option<u16>,

    /// Error body message when `error_code` is set
    #[serde(default)]
    pub error_message: Option<String>,

    /// Request requirements for the primary response
    #[serde(default)]
    pub conditions: Option<ConditionSet>,

    /// Body used when `conditions` are not met
    #[serde(default)]
    pub fallback: Option<Value>,
}

/// Accepts any non-negative JSON number, truncating fractional milliseconds.
fn millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom("delay must be a non-negative number"));
    }
    Ok(value as u64)
}

/// Integral status codes, also when written as `500.0`.
fn status_code<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if value.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&value) {
        return Err(serde::de::Error::custom(format!("invalid status code {}", value)));
    }
    Ok(Some(value as u16))
}

/// The closed set of methods a route may be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 6] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Whether an incoming transport method is this one.
    pub fn matches(&self, method: &axum::http::Method) -> bool {
        method.as_str() == self.as_str()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == upper)
            .ok_or_else(|| format!("unsupported method `{}`", s))
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Declarative request requirements.
///
/// Each section is a (possibly nested) map of field to expected value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSet {
    #[serde(default)]
    pub query: Option<Map<String, Value>>,

    #[serde(default)]
    pub headers: Option<Map<String, Value>>,

    #[serde(default)]
    pub body: Option<Map<String, Value>>,
}

impl ConditionSet {
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.headers.is_none() && self.body.is_none()
    }
}

/// Settings applied across all routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Headers added to every response (templated against timing data only)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// CORS handling
    #[serde(default)]
    pub cors: Option<CorsSetting>,

    /// Log every matched route at info level
    #[serde(default = "default_true")]
    pub log_matches: bool,
}

fn default_true() -> bool {
    true
}

/// `cors: true`, `cors: false` or an options object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorsSetting {
    Enabled(bool),
    Options(CorsOptions),
}

/// CORS options, mirroring the standard middleware contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CorsOptions {
    #[serde(default)]
    pub origin: Option<CorsOrigin>,

    #[serde(default)]
    pub methods: Option<StringList>,

    #[serde(default)]
    pub allowed_headers: Option<StringList>,

    #[serde(default)]
    pub exposed_headers: Option<StringList>,

    #[serde(default)]
    pub credentials: Option<bool>,

    /// Preflight cache lifetime in seconds
    #[serde(default)]
    pub max_age: Option<f64>,

    #[serde(default)]
    pub preflight_continue: Option<bool>,

    #[serde(default, deserialize_with = "status_code")]
    pub options_success_status: Option<u16>,
}

/// Allowed origin(s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// `true` reflects the request origin, `false` disables CORS
    Reflect(bool),
    /// A single origin, or `*`
    One(String),
    Many(Vec<String>),
}

/// A comma-separated string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    pub fn items(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            StringList::One(s) => s.split(',').collect(),
            StringList::Many(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_route() {
        let doc = r#"{
            "routes": [
                { "method": "get", "path": "/users/:id", "response": { "id": "{{id}}" } }
            ]
        }"#;
        let config = ServerConfig::parse(doc, ConfigFormat::Json).unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].method, HttpMethod::Get);
        assert_eq!(config.routes[0].path, "/users/:id");
        assert_eq!(config.routes[0].delay, 0);
        assert!(config.globals.is_none());
        assert!(config.log_matches());
    }

    #[test]
    fn test_parse_error_route() {
        let config = ServerConfig::from_value(json!({
            "routes": [{
                "method": "POST",
                "path": "/fail",
                "errorCode": 503,
                "errorMessage": "down for maintenance"
            }]
        }))
        .unwrap();

        let route = &config.routes[0];
        assert_eq!(route.error_code, Some(503));
        assert_eq!(route.error_message.as_deref(), Some("down for maintenance"));
        assert!(route.response.is_none());
    }

    #[test]
    fn test_fractional_delay_truncates() {
        let config = ServerConfig::from_value(json!({
            "routes": [{ "method": "GET", "path": "/slow", "response": {}, "delay": 250.9 }]
        }))
        .unwrap();
        assert_eq!(config.routes[0].delay, 250);
    }

    #[test]
    fn test_integral_float_error_code() {
        let config = ServerConfig::from_value(json!({
            "routes": [{ "method": "GET", "path": "/fail", "errorCode": 500.0 }]
        }))
        .unwrap();
        assert_eq!(config.routes[0].error_code, Some(500));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("patch".parse::<HttpMethod>(), Ok(HttpMethod::Patch));
        assert_eq!(" Options ".parse::<HttpMethod>(), Ok(HttpMethod::Options));
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert!(HttpMethod::Delete.matches(&axum::http::Method::DELETE));
        assert!(!HttpMethod::Delete.matches(&axum::http::Method::GET));
    }

    #[test]
    fn test_parse_globals() {
        let config = ServerConfig::from_value(json!({
            "routes": [{ "method": "GET", "path": "/", "response": "ok" }],
            "globals": {
                "headers": { "X-Served-By": "mock" },
                "cors": {
                    "origin": ["http://a.test", "http://b.test"],
                    "methods": "GET, POST",
                    "maxAge": 600
                },
                "logMatches": false
            }
        }))
        .unwrap();

        let headers: Vec<_> = config.global_headers().collect();
        assert_eq!(headers.len(), 1);
        assert!(!config.log_matches());

        match config.globals.unwrap().cors {
            Some(CorsSetting::Options(opts)) => {
                assert!(matches!(opts.origin, Some(CorsOrigin::Many(ref v)) if v.len() == 2));
                assert_eq!(opts.methods.unwrap().items(), vec!["GET", "POST"]);
                assert_eq!(opts.max_age, Some(600.0));
            }
            other => panic!("Expected CORS options, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_cors_bool() {
        let config = ServerConfig::from_value(json!({
            "routes": [{ "method": "GET", "path": "/", "response": "ok" }],
            "globals": { "cors": true }
        }))
        .unwrap();
        assert!(matches!(
            config.globals.unwrap().cors,
            Some(CorsSetting::Enabled(true))
        ));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
routes:
  - method: put
    path: /items/:id
    delay: 10
    response:
      updated: "{{id}}"
"#;
        let config = ServerConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.routes[0].method, HttpMethod::Put);
        assert_eq!(config.routes[0].delay, 10);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("mocks.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("mocks.YML")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("mocks")), ConfigFormat::Json);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = ServerConfig::parse("{ routes: ", ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ServerConfig::load(Path::new("/definitely/not/here.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
