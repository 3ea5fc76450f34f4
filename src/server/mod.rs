//! HTTP control plane.
//!
//! Exposes the fleet coordination surface: dispatch, pre-flight approval,
//! completion with acceptance checking, critic validation, workflow
//! status/gates, and agent registration/liveness.

pub mod routes;

pub use routes::{app_router, AppState};
