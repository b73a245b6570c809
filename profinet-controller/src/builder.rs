//! Fluent construction of a controller for hosts that prefer code over a config file.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{ControllerConfig, StationConfig};
use crate::controller::{new_controller, Controller, ControllerError, ControllerRunner};

/// Builder for a [`Controller`] and its runner.
///
/// ```no_run
/// # use profinet_controller::ControllerBuilder;
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let (controller, runner) = ControllerBuilder::new()
///     .interface("eth1")
///     .cycle_time_ms(32)
///     .build()?;
/// tokio::spawn(runner.run());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ControllerBuilder {
    config: ControllerConfig,
}

impl ControllerBuilder {
    /// A builder with default configuration.
    pub fn new() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder { config }
    }

    /// The interface to bind, e.g. `eth1`.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.config.interface = Some(interface.into());
        self
    }

    /// The local address RPC sockets bind to.
    pub fn local_ip(mut self, ip: Ipv4Addr) -> Self {
        self.config.local_ip = Some(ip);
        self
    }

    /// Our own station name.
    pub fn controller_station_name(mut self, name: impl Into<String>) -> Self {
        self.config.controller_station_name = name.into();
        self
    }

    /// Cycle time in milliseconds; a power of two between 1 and 512.
    pub fn cycle_time_ms(mut self, cycle_time_ms: u32) -> Self {
        self.config.cycle_time_ms = cycle_time_ms;
        self
    }

    /// Watchdog multiplier on the cycle time.
    pub fn watchdog_factor(mut self, watchdog_factor: u16) -> Self {
        self.config.watchdog_factor = watchdog_factor;
        self
    }

    /// Per-call RPC deadline in milliseconds.
    pub fn rpc_timeout_ms(mut self, rpc_timeout_ms: u64) -> Self {
        self.config.rpc_timeout_ms = rpc_timeout_ms;
        self
    }

    /// Identify sweep interval in milliseconds.
    pub fn discovery_interval_ms(mut self, discovery_interval_ms: u64) -> Self {
        self.config.discovery_interval_ms = discovery_interval_ms;
        self
    }

    /// Stale-command threshold in milliseconds.
    pub fn stale_command_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.config.stale_command_threshold_ms = threshold_ms;
        self
    }

    /// Authority epoch persistence file.
    pub fn authority_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.authority_file = path.into();
        self
    }

    /// Add a station to manage.
    pub fn station(mut self, station: StationConfig) -> Self {
        self.config.stations.push(station);
        self
    }

    /// Validate and assemble the controller.
    pub fn build(self) -> Result<(Controller, ControllerRunner), ControllerError> {
        new_controller(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_assembles_a_controller() {
        let result = ControllerBuilder::new()
            .interface("eth-test")
            .cycle_time_ms(64)
            .watchdog_factor(3)
            .build();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn builder_rejects_bad_cycle_time() {
        let result = ControllerBuilder::new().cycle_time_ms(100).build();
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }
}
