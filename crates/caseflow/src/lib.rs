//! Recommendation orchestration engine for case-management coordination.
//!
//! The crate ingests normalized domain events, scores them against a
//! configured set of weighted indicator rules, and turns qualifying scores
//! into reviewable recommendations with an ordered action plan. Once a
//! caseworker approves a recommendation the executor runs the plan against
//! the configured downstream systems, step by step, with retries and a
//! bounded call timeout.
//!
//! Surrounding concerns (authentication, dashboards, rendering) live outside
//! this crate and consume it through [`orchestration::Engine`] or the axum
//! router returned by [`orchestration::engine_router`].

pub mod config;
pub mod error;
pub mod orchestration;
pub mod telemetry;
