//! etcd v3 client for the CKE controller
//!
//! Provides the key-value, lease, watch and membership operations the
//! controller needs, plus lease-backed sessions and leader election built
//! on top of them.
//!
//! # Example
//!
//! ```no_run
//! use kv_client::{EtcdClient, EtcdConfig, KvClientTrait};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = EtcdClient::new(EtcdConfig {
//!     endpoints: vec!["https://10.0.0.1:2379".to_string()],
//!     timeout: Duration::from_secs(2),
//!     ..Default::default()
//! })?;
//!
//! if let Some(kv) = client.get("/cke/cluster").await? {
//!     println!("cluster at revision {}", kv.mod_revision);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod election;
pub mod error;
#[path = "trait.rs"]
pub mod kv_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod models;

pub use client::{EtcdClient, EtcdConfig};
pub use election::{Election, LeaderKey, Session};
pub use error::KvError;
pub use kv_trait::{KvClientTrait, MemberClientTrait, WatchStream};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockKvClient;
pub use models::*;
