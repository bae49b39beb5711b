//! CKE cluster model
//!
//! Typed representation of everything the controller reads, observes and
//! persists:
//! - `Cluster`: the declared, revisioned cluster configuration
//! - `Resources`: declared Kubernetes resources applied by the controller
//! - `ClusterStatus`: a transient snapshot produced by one prober pass
//! - `Record`: the durable log entry describing one executed plan
//! - `CertificateMetadata`: vault bookkeeping for issued certificates

pub mod certificate;
pub mod cluster;
pub mod duration;
pub mod error;
pub mod record;
pub mod resources;
pub mod status;

pub use certificate::*;
pub use cluster::*;
pub use error::*;
pub use record::*;
pub use resources::*;
pub use status::*;
