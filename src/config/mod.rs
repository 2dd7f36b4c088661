//! # Configuration
//!
//! Operator-level settings. Everything is read once at startup and passed
//! down explicitly; nothing here is mutated after the manager starts.

mod controller;

pub use controller::ControllerConfig;
