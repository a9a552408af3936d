//! Authenticating reverse proxy for a single-sign-on protected backend.
//!
//! Per request, the admission chain decides whether the caller is already
//! authenticated via the ticket service, whether the request is a
//! machine-to-machine call the backend authenticates itself, whether it is a
//! logout request to redirect, and whether the caller must be throttled for
//! repeated authentication failures. Only admitted requests are forwarded,
//! with the principal's identity header injected.

pub mod app;
pub mod classify;
pub mod config;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod middleware;
pub mod pipeline;
pub mod services;
pub mod state;
