//! Relay Core
//!
//! Core domain types, traits, and error handling for the relay build
//! orchestrator. This crate has minimal dependencies and defines the shared
//! vocabulary used by the scheduler, the command-line binary and the tests.

pub mod action;
pub mod error;
pub mod events;
pub mod ids;
pub mod lock;
pub mod platform;
pub mod ports;
pub mod project;
pub mod properties;
pub mod settings;
pub mod target;
pub mod trigger;

pub use error::{Error, Result};
pub use ids::*;
