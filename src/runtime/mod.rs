//! # Runtime
//!
//! Wiring between the reconcilers and kube-runtime.
//!
//! - `error_policy`: requeue decisions for failed reconciliations
//! - `watch_loop`: the KeystoneAPI and KeystoneService controllers

pub mod error_policy;
pub mod watch_loop;
