//! companion-service: the AI mediation layer of the companion app.
//!
//! Everything between a child's message and the hosted Gemini API lives
//! here: the invocation gateway (quota ledger, rate limiter, circuit
//! breaker), the two-stage content-safety pipeline, durable safety flags,
//! and the idempotent scheduled report generators.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
