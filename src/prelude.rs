//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use keystone_operator::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Seams the reconcilers run against
pub use crate::cluster::{Cluster, ClusterError, ObjectRef, ResourceKind};
pub use crate::identity::{IdentityBackend, IdentityConnector, IdentityError};

// Reconciler types
pub use crate::controller::{Context, ReconcilerError};

pub use crate::config::ControllerConfig;
