//! jca-pool: a pooled connection lifecycle engine.
//!
//! Physical connections produced by a [`ManagedConnectionFactory`] are
//! wrapped in [`ConnectionListener`]s and kept in per-credential sub-pools.
//! Applications see only [`ConnectionHandle`]s; closing the last handle
//! returns the listener to its sub-pool, unless the listener is enlisted in
//! a transaction, in which case it goes back when the transaction completes.
//!
//! # Layers
//!
//! - [`resource`]: the contract a resource adapter implements.
//! - [`pool`]: listeners, sub-pools, the partitioned [`Pool`] and its
//!   background maintenance.
//! - [`capacity`]: pluggable growth and shrink policies.
//! - [`tx`]: transaction enlistment plus a thread-bound in-memory
//!   transaction manager.
//! - [`manager`]: the allocation façade with retry and per-transaction
//!   connection sharing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use jca_pool::{ConnectionManager, Credential, Pool, PoolConfiguration};
//! use jca_pool::resource::memory::MemoryConnectionFactory;
//!
//! let pool = Pool::new(PoolConfiguration::default(), Arc::new(MemoryConnectionFactory::new()))?;
//! let manager = ConnectionManager::new(pool);
//! let handle = manager.allocate_connection(&Credential::anonymous())?;
//! handle.close()?;
//! # Ok::<(), jca_pool::PoolError>(())
//! ```

pub mod capacity;
pub mod cli;
pub mod config;
pub mod credential;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod resource;
pub mod shutdown;
pub mod telemetry;
pub mod tx;

pub use capacity::{CapacityPolicy, CapacityRegistry};
pub use config::{ConfigError, PoolConfiguration};
pub use credential::{Credential, PoolKey, PoolStrategy, RequestInfo, Subject};
pub use error::{PoolError, ResourceError};
pub use health::{HealthChecker, HealthReport, HealthState};
pub use manager::ConnectionManager;
pub use pool::{
    ConnectionListener, FlushStrategy, ListenerState, Pool, PoolStatistics, SubPool,
    SubPoolStatistics,
};
pub use resource::{Capability, ConnectionHandle, ManagedConnection, ManagedConnectionFactory};
pub use shutdown::{ShutdownResult, ShutdownState};
