//! HTTP control plane for the job registry: session-gated routes to launch,
//! list and stop jobs, plus the stale-job sweeper wiring.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error_payload;
pub mod routes;
pub mod security;
pub mod state;
pub mod telemetry;
