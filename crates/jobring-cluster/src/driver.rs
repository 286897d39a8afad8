//! Membership source capability and its options.
//!
//! A [`MembershipSource`] tells the pool who is alive and who "we" are. The
//! pool owns exactly one source by composition; there is no process-wide
//! driver. Backends (a shared store, a static list, a test double) plug in
//! without touching the pool or the ring.

use std::time::Duration;

use crate::error::DriverError;

/// Fetch timeout used when no [`DriverOption::Timeout`] is supplied.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// A named option passed to [`MembershipSource::init`].
#[derive(Debug, Clone)]
pub enum DriverOption {
    /// Bounds every subsequent [`MembershipSource::get_nodes`] call.
    Timeout(Duration),
    /// Diagnostic sink: driver events are recorded inside this span.
    Span(tracing::Span),
}

/// Resolved driver options with defaults applied.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Upper bound for one membership fetch.
    pub timeout: Duration,
    /// Parent span for driver diagnostics. `Span::none()` discards nothing
    /// and never fails, so an absent sink is safe.
    pub span: tracing::Span,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            span: tracing::Span::none(),
        }
    }
}

impl DriverOptions {
    /// Apply options in order; later options override earlier ones.
    pub fn from_options(options: impl IntoIterator<Item = DriverOption>) -> Self {
        let mut resolved = Self::default();
        for option in options {
            match option {
                DriverOption::Timeout(timeout) => resolved.timeout = timeout,
                DriverOption::Span(span) => resolved.span = span,
            }
        }
        resolved
    }
}

/// Source of live membership for one service group.
///
/// Preconditions every implementation must honor:
///
/// 1. `start` and `stop` may be called more than once, in any sequence of
///    start/stop cycles, for the lifetime of the driver.
/// 2. `get_nodes` returns an error once the configured timeout elapses
///    instead of hanging.
/// 3. While membership is unchanged, `get_nodes` returns the same list in
///    the same order.
/// 4. `node_id` is stable for at least one start/stop cycle.
#[async_trait::async_trait]
pub trait MembershipSource: Send + Sync {
    /// Configure the driver for `service_name`. Called once, before `start`.
    fn init(&mut self, service_name: &str, options: Vec<DriverOption>);

    /// Identifier of this process within the group.
    fn node_id(&self) -> String;

    /// Fetch the current list of live members.
    async fn get_nodes(&self) -> Result<Vec<String>, DriverError>;

    /// Begin participating in the group (register, heartbeat, ...).
    async fn start(&self) -> Result<(), DriverError>;

    /// Stop participating in the group.
    async fn stop(&self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default_when_empty() {
        let opts = DriverOptions::from_options(Vec::new());
        assert_eq!(opts.timeout, DEFAULT_FETCH_TIMEOUT);
        assert!(opts.span.is_none());
    }

    #[test]
    fn test_later_option_wins() {
        let opts = DriverOptions::from_options([
            DriverOption::Timeout(Duration::from_secs(1)),
            DriverOption::Timeout(Duration::from_millis(250)),
        ]);
        assert_eq!(opts.timeout, Duration::from_millis(250));
    }
}
