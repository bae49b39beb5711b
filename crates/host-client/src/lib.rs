//! Cluster host access
//!
//! Remote command execution and container management on the machines of a
//! cluster. Every host is reached over SSH; the container engine is the
//! Docker CLI driven through the same connection.
//!
//! # Example
//!
//! ```no_run
//! use host_client::{ContainerEngine, HostPool, SshConfig, SshConnector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = HostPool::new(
//!     Arc::new(SshConnector::new(SshConfig::default())),
//!     Duration::from_secs(300),
//! );
//! let engine = pool.engine("10.0.0.1", "cke").await?;
//! engine.pull_image("quay.io/cybozu/etcd:3.5").await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pool;
pub mod shell;

pub use engine::{ContainerEngine, ContainerInfo, ContainerSpec, DockerEngine, Mount, SPEC_HASH_LABEL};
pub use error::HostError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockConnector, MockHost};
pub use pool::{ChannelKind, Connector, HostPool, SshConnector};
pub use shell::{ExecOutput, RemoteShell, SshConfig, SshShell, shell_join, shell_quote};
