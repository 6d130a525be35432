//! JSON Mock Server
//!
//! A configuration-driven HTTP mock server. Routes declared in a JSON (or
//! YAML) file are served with templated JSON responses, simulated latency,
//! injected errors and conditional answers. The config file is watched and
//! reloaded atomically; shutdown drains in-flight requests.
//!
//! # Features
//!
//! - **Route Matching**: Method plus path patterns with `:params` and a trailing `*`
//! - **Templates**: `{{field}}` substitution plus `timestamp`, `random`, `uuid` and `responseTime`
//! - **Conditions**: Subset matching on query, headers and body, with a fallback response
//! - **Failure Injection**: Fixed error codes and non-blocking delays
//! - **Hot Reload**: Invalid reloads are rejected and the current routes kept
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "routes": [
//!     {
//!       "method": "GET",
//!       "path": "/users/:id",
//!       "response": { "id": "{{id}}", "name": "User {{id}}", "at": "{{timestamp}}" },
//!       "delay": 250
//!     },
//!     {
//!       "method": "GET",
//!       "path": "/plans",
//!       "conditions": { "query": { "type": "premium" } },
//!       "response": { "plan": "premium" },
//!       "fallback": { "status": 402, "body": { "error": "upgrade required" } }
//!     },
//!     { "method": "POST", "path": "/fail", "errorCode": 503, "errorMessage": "try later" }
//!   ],
//!   "globals": {
//!     "headers": { "X-Response-Time": "{{responseTime}}ms" },
//!     "cors": { "origin": "*", "maxAge": 600 }
//!   }
//! }
//! ```

pub mod config;
pub mod cors;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod matcher;
pub mod server;
pub mod state;
pub mod template;
pub mod validation;
pub mod watcher;

pub use config::ServerConfig;
pub use error::{ConfigError, ServerError, TemplateError};
pub use lifecycle::{start, ServerHandle, ServerOptions};
pub use state::ServerState;
