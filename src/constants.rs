//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "keystone-operator";

/// Default HTTP server port for metrics, health probes and admission
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Requeue delay while a prerequisite is missing or not yet ready (seconds)
pub const DEFAULT_NOT_READY_REQUEUE_SECS: u64 = 5;

/// Default requeue interval for reconciliation errors (seconds)
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;

/// Requeue delay after an optimistic-concurrency conflict (seconds)
pub const CONFLICT_REQUEUE_SECS: u64 = 1;

/// Fibonacci backoff bounds for failed reconciliations (minutes)
pub const DEFAULT_BACKOFF_MIN_MINUTES: u64 = 1;
pub const DEFAULT_BACKOFF_MAX_MINUTES: u64 = 10;

/// Timeout for a single identity backend request (seconds)
pub const DEFAULT_IDENTITY_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Image used when a KeystoneAPI does not pin one
pub const DEFAULT_KEYSTONE_API_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-keystone:current-podified";

/// Environment variable carrying the default image (set by the operator bundle)
pub const KEYSTONE_API_IMAGE_ENV: &str = "RELATED_IMAGE_KEYSTONE_API_IMAGE_URL_DEFAULT";

/// Name under which keystone registers itself and its database
pub const SERVICE_NAME: &str = "keystone";

/// Port both keystone endpoints listen on
pub const KEYSTONE_PUBLIC_PORT: i32 = 5000;

// Finalizers

/// Finalizer a KeystoneAPI places on itself and on the MariaDB objects it consumes
pub const KEYSTONE_API_FINALIZER: &str = "openstack.org/keystoneapi";

/// Finalizer a KeystoneService places on itself
pub const KEYSTONE_SERVICE_FINALIZER: &str = "openstack.org/keystoneservice";

// Labels and annotations

/// Annotation on the fernet secret recording the last rotation (RFC3339)
pub const FERNET_ROTATED_AT_ANNOTATION: &str = "keystone.openstack.org/rotatedat";

/// Label carrying the input hash a Job was rendered from
pub const JOB_HASH_LABEL: &str = "keystone.openstack.org/hash";

/// Pod template annotation forcing a rollout when inputs change
pub const CONFIG_HASH_ANNOTATION: &str = "keystone.openstack.org/config-hash";

/// Annotation with the Multus network attachments for the API pods
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Common label selecting keystone pods and services
pub const SERVICE_LABEL: &str = "service";

// Fernet key ring

/// Data key prefix of the fernet secret (`FernetKeys0`..`FernetKeysN-1`)
pub const FERNET_KEY_PREFIX: &str = "FernetKeys";

/// Smallest ring that keeps in-flight tokens valid across a rotation
pub const MIN_FERNET_KEYS: i32 = 3;

/// Default number of active fernet keys
pub const DEFAULT_FERNET_MAX_ACTIVE_KEYS: i32 = 5;

/// Raw length of a fernet key before encoding (bytes)
pub const FERNET_KEY_LEN: usize = 32;

// Identity catalogue

/// Project service users are created in
pub const SERVICE_PROJECT: &str = "service";

/// Domain every identity entity lives in
pub const DEFAULT_DOMAIN: &str = "default";

/// Roles granted to every service user
pub const SERVICE_USER_ROLES: [&str; 2] = ["admin", "service"];

/// Recognised service override keys
pub const ENDPOINT_PUBLIC: &str = "public";
pub const ENDPOINT_INTERNAL: &str = "internal";

/// Mount path for federation realm configuration
pub const DEFAULT_FEDERATION_MOUNT_PATH: &str =
    "/var/lib/config-data/default/multirealm-federation";
