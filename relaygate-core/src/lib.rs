//! Relaygate Core: policy execution and outbound dispatch for an API/XML gateway.
//!
//! This library carries the two subsystems every relaygate deployment depends on:
//!
//! 1. The **policy execution contract**. A tree of [`policy::PolicyNode`]s
//!    consumes and mutates a per-exchange [`context::ExecutionContext`],
//!    short-circuits on the first stop [`policy::Outcome`], and releases
//!    resources deterministically.
//! 2. The **outbound dispatch engine**. Routing nodes resolve candidate
//!    endpoints through a [`failover::FailoverStrategy`], attempt HTTP or
//!    queue transport calls, and write the result back into the context.
//!
//! The HTTP front end lives in the `relaygate-proxy` crate; everything here is
//! transport-agnostic on the inbound side.

pub mod config;
pub mod context;
pub mod error;
pub mod failover;
pub mod message;
pub mod policy;
pub mod routing;
pub mod stash;
