//! Relaygate HTTP front end.
//!
//! Accepts inbound HTTP, runs each exchange through the policy tree of the
//! service mounted at the request path, and renders the result.

pub mod cli;
pub mod error;
pub mod logging;
pub mod service;
