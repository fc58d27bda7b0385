//! nestvc - multi-tenant cluster virtualization
//!
//! Projects many isolated tenant ("virtual") clusters onto a single shared
//! "super" cluster. Every tenant-visible resource has a namespace-remapped
//! mirror object in the super cluster; this crate implements the
//! per-resource-type engine that keeps the two sides consistent:
//!
//! - downward sync (DWS): tenant events drive create/update/delete of the
//!   mirrored physical objects
//! - upward sync (UWS): physical status changes flow back to the owning
//!   virtual object, gated by feature flags
//! - patrol: a periodic full-state pass that repairs drift the event loops
//!   missed

#![deny(missing_docs)]

pub mod backend;
pub mod cluster_version;
pub mod conversion;
pub mod error;
pub mod featuregate;
pub mod retry;
pub mod syncer;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation recording the UID of the owning virtual object.
///
/// This marker is the sole basis for "is this mine to touch" decisions:
/// a physical object without it is foreign and is never mutated or deleted.
pub const OWNER_UID_ANNOTATION: &str = "tenancy.nestvc.io/owner-uid";

/// Annotation recording the cluster key of the owning tenant cluster
pub const CLUSTER_ANNOTATION: &str = "tenancy.nestvc.io/cluster";

/// Annotation recording the tenant-side namespace of the owning virtual object
pub const TENANT_NAMESPACE_ANNOTATION: &str = "tenancy.nestvc.io/namespace";

/// Field manager used for all writes against either cluster backend
pub const FIELD_MANAGER: &str = "nestvc-syncer";
