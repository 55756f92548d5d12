//! YAML configuration for services, fragments and routing nodes.
//!
//! # Example
//!
//! ```yaml
//! schema: 1
//! listen: { port: 8080 }
//! services:
//!   - name: orders
//!     path: /orders
//!     policy:
//!       kind: http_route
//!       urls: ["http://${env:ORDERS_HOST}${request.http.uri}"]
//! ```
//!
//! `${env:VAR}` is resolved once at load time; every other `${...}` is an
//! exchange variable resolved per request.

pub mod defaults;
pub mod duration_format;
pub mod error;
pub mod loader;
pub mod schema;

pub use defaults::RelaygateDefaults;
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{find_config_file, load_and_validate, load_config, parse_config, validate};
pub use schema::{Config, NodeConfig, ServiceConfig};
