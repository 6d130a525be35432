//! CORS policy built from `globals.cors`.
//!
//! Header injection and preflight answers are delegated to
//! `tower_http::cors`. The policy lives inside the route table so a config
//! reload swaps it together with the routes.

use crate::config::{CorsOptions, CorsOrigin, CorsSetting, StringList};
use crate::error::ConfigError;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer, ExposeHeaders};

const DEFAULT_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::PATCH,
    Method::POST,
    Method::DELETE,
];

/// A compiled CORS policy.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    layer: CorsLayer,
    preflight_status: StatusCode,
}

impl CorsPolicy {
    /// Build the policy for a CORS setting. `None` means CORS is disabled.
    pub fn from_setting(setting: Option<&CorsSetting>) -> Result<Option<Self>, ConfigError> {
        match setting {
            None | Some(CorsSetting::Enabled(false)) => Ok(None),
            Some(CorsSetting::Enabled(true)) => Self::from_options(&CorsOptions::default()),
            Some(CorsSetting::Options(options)) => Self::from_options(options),
        }
    }

    fn from_options(options: &CorsOptions) -> Result<Option<Self>, ConfigError> {
        let credentials = options.credentials.unwrap_or(false);

        // Wildcards cannot be combined with credentials; reflect the request instead.
        let origin = match &options.origin {
            Some(CorsOrigin::Reflect(false)) => return Ok(None),
            Some(CorsOrigin::Reflect(true)) => AllowOrigin::mirror_request(),
            Some(CorsOrigin::One(origin)) if origin == "*" => any_origin(credentials),
            Some(CorsOrigin::Many(origins)) if origins.iter().any(|o| o == "*") => {
                any_origin(credentials)
            }
            Some(CorsOrigin::One(origin)) => AllowOrigin::exact(header_value("origin", origin)?),
            Some(CorsOrigin::Many(origins)) => AllowOrigin::list(
                origins
                    .iter()
                    .map(|o| header_value("origin", o))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => any_origin(credentials),
        };

        let methods = match &options.methods {
            Some(list) => list
                .items()
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| ConfigError::Invalid(format!("invalid CORS method `{}`", m)))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => DEFAULT_METHODS.to_vec(),
        };

        let allowed_headers = match &options.allowed_headers {
            Some(list) if is_wildcard(list) && !credentials => AllowHeaders::from(Any),
            Some(list) if is_wildcard(list) => AllowHeaders::mirror_request(),
            Some(list) => AllowHeaders::list(header_names("allowedHeaders", list)?),
            None => AllowHeaders::mirror_request(),
        };

        let mut layer = CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(allowed_headers)
            .allow_credentials(credentials);

        match &options.exposed_headers {
            Some(list) if is_wildcard(list) => {
                if !credentials {
                    layer = layer.expose_headers(ExposeHeaders::from(Any));
                }
            }
            Some(list) => {
                layer = layer.expose_headers(ExposeHeaders::list(header_names(
                    "exposedHeaders",
                    list,
                )?));
            }
            None => {}
        }

        if let Some(max_age) = options.max_age {
            let max_age = Duration::try_from_secs_f64(max_age).map_err(|_| {
                ConfigError::Invalid(format!("CORS option `maxAge` is out of range: {}", max_age))
            })?;
            layer = layer.max_age(max_age);
        }

        let preflight_status = options
            .options_success_status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::NO_CONTENT);

        Ok(Some(Self {
            layer,
            preflight_status,
        }))
    }

    pub fn layer(&self) -> &CorsLayer {
        &self.layer
    }

    /// Status used for answered preflight requests.
    pub fn preflight_status(&self) -> StatusCode {
        self.preflight_status
    }
}

/// Whether a request is a CORS preflight.
pub fn is_preflight<B>(request: &Request<B>) -> bool {
    request.method() == Method::OPTIONS
        && request.headers().contains_key(header::ORIGIN)
        && request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

fn any_origin(credentials: bool) -> AllowOrigin {
    if credentials {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::from(Any)
    }
}

fn is_wildcard(list: &StringList) -> bool {
    list.items().iter().any(|item| item == "*")
}

fn header_value(option: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value)
        .map_err(|_| ConfigError::Invalid(format!("invalid CORS {} `{}`", option, value)))
}

fn header_names(option: &str, list: &StringList) -> Result<Vec<HeaderName>, ConfigError> {
    list.items()
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::Invalid(format!("invalid CORS {} `{}`", option, name)))
        })
        .collect()
}
