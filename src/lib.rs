//! Foreman - deterministic agent orchestration scheduler
//!
//! A filesystem-backed scheduler that drives a fleet of AI coding
//! agents through a structured lifecycle:
//! - Durable task store with an enforced status state machine
//! - Periodic poll loop for promotion, dispatch, and recovery
//! - Protocol router for structured agent messages
//! - Configurable multi-gate review workflows
//! - Deadletter handling for tasks that cannot be dispatched

pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{DomainError, DomainResult};
