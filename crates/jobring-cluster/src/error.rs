//! Error types for the cluster crate.

use std::time::Duration;

use crate::pool::PoolState;

/// Errors produced by a [`MembershipSource`](crate::MembershipSource).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The driver was asked for members before `start` or after `stop`.
    #[error("driver not started")]
    NotStarted,

    /// A membership fetch did not complete within the configured timeout.
    #[error("membership fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The backing coordination store could not be reached.
    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by [`NodePool`](crate::NodePool) lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The membership driver failed.
    #[error("membership driver error: {0}")]
    Driver(#[from] DriverError),

    /// `start` was called on a pool that is already running.
    #[error("node pool already running")]
    AlreadyRunning,

    /// `start` was called on a pool that has been stopped. Build a new pool.
    #[error("node pool stopped; construct a new pool to run again")]
    Stopped,

    /// A lifecycle call raced with another one in progress.
    #[error("node pool is {0:?}")]
    InvalidState(PoolState),

    /// The refresh task panicked or was aborted.
    #[error("refresh task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
