//! # Controller
//!
//! Reconciliation core shared by both resources.
//!
//! - `conditions`: folds sub-conditions into Ready
//! - `gate`: stage ordering and bounded requeues
//! - `finalizers`: cross-resource deletion markers
//! - `fernet`: the fernet key ring
//! - `keystone_api` / `keystone_service`: the two reconcilers
//! - `scope`: panic-safe status writes
//! - `backoff`: Fibonacci backoff used by the error policy

pub mod backoff;
pub mod conditions;
pub mod fernet;
pub mod finalizers;
pub mod gate;
pub mod hash;
pub mod keystone_api;
pub mod keystone_service;
pub mod scope;
pub mod types;

pub use types::{Context, ReconcilerError};
