//! Job-to-node affinity for a fleet of identical scheduler processes.
//!
//! This crate provides:
//!
//! - [`NodePool`]: keeps a [`HashRing`](jobring_placement::HashRing)
//!   snapshot current against live membership and answers "does this node
//!   own this job right now?".
//! - [`MembershipSource`]: the pluggable discovery capability the pool
//!   depends on, with [`RegistryDriver`] (heartbeats in a
//!   [`SharedRegistry`]) and [`StaticDriver`] backends.
//! - [`PoolConfig`]: construction-time configuration.

pub mod config;
pub mod driver;
mod error;
pub mod pool;
pub mod registry;
mod static_driver;


pub use config::{MembershipComparison, PoolConfig};
pub use driver::{DriverOption, DriverOptions, MembershipSource};
pub use error::{ClusterError, DriverError};
pub use pool::{NodePool, PoolEvent, PoolState};
pub use registry::{RegistryDriver, SharedRegistry};
pub use static_driver::StaticDriver;
