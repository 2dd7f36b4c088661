//! Keystone Operator Library
//!
//! Reconcilers, custom resources and the cluster/identity seams they run
//! against. The `keystone-operator` binary wires these to a live cluster;
//! integration tests wire them to in-memory fakes.
//!
//! ## Quick Start
//!
//! ```rust
//! use keystone_operator::prelude::*;
//! ```

pub mod admission;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod identity;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
