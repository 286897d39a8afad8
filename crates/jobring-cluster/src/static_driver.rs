//! A [`MembershipSource`] backed by a fixed member list.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::driver::{DriverOption, DriverOptions, MembershipSource};
use crate::error::DriverError;

/// Fixed membership: always reports the same members and the same own id.
///
/// Useful for single-process tools and for computing placement offline.
#[derive(Debug)]
pub struct StaticDriver {
    node_id: String,
    members: Vec<String>,
    options: DriverOptions,
    started: AtomicBool,
}

impl StaticDriver {
    /// Create a driver that identifies as `node_id` within `members`.
    pub fn new(node_id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            members,
            options: DriverOptions::default(),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl MembershipSource for StaticDriver {
    fn init(&mut self, service_name: &str, options: Vec<DriverOption>) {
        self.options = DriverOptions::from_options(options);
        let _enter = self.options.span.enter();
        debug!(service = service_name, members = self.members.len(), "static driver initialised");
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn get_nodes(&self) -> Result<Vec<String>, DriverError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(DriverError::NotStarted);
        }
        Ok(self.members.clone())
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_driver_requires_start() {
        let driver = StaticDriver::new("a", vec!["a".into(), "b".into()]);
        assert_eq!(driver.get_nodes().await, Err(DriverError::NotStarted));

        driver.start().await.unwrap();
        assert_eq!(driver.get_nodes().await.unwrap(), vec!["a", "b"]);

        driver.stop().await.unwrap();
        assert_eq!(driver.get_nodes().await, Err(DriverError::NotStarted));

        // Start/stop cycles are repeatable.
        driver.start().await.unwrap();
        assert_eq!(driver.node_id(), "a");
        assert!(driver.get_nodes().await.is_ok());
    }
}
