//! Validated startup settings for the servers and clients.

use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default UDP port the port reservation service listens on.
pub const DEFAULT_PRS_PORT: u16 = 30000;
/// Default first leasable client port.
pub const DEFAULT_START_PORT: u16 = 40000;
/// Default last leasable client port (inclusive).
pub const DEFAULT_END_PORT: u16 = 40099;
/// Default keep-alive window for a lease, in seconds.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 300;
/// Default interval between keep-alives sent by a leasing server, in seconds.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 60;
/// Service name the session server registers under.
pub const DEFAULT_SD_SERVICE_NAME: &str = "SD Server";
/// Default client-side wait for a reply.
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 5;

/// Port reservation service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrsConfig {
    /// UDP port the service binds.
    pub service_port: u16,
    /// First leasable port (inclusive).
    pub start_port: u16,
    /// Last leasable port (inclusive).
    pub end_port: u16,
    /// A lease not renewed within this window is reclaimed.
    pub keep_alive_timeout: Duration,
}

impl PrsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_port < self.start_port {
            return Err(ConfigError::InvalidPortRange {
                start: self.start_port,
                end: self.end_port,
            });
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("keep-alive timeout"));
        }
        Ok(())
    }

    /// Address the service binds on all interfaces.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.service_port)
    }
}

impl Default for PrsConfig {
    fn default() -> Self {
        Self {
            service_port: DEFAULT_PRS_PORT,
            start_port: DEFAULT_START_PORT,
            end_port: DEFAULT_END_PORT,
            keep_alive_timeout: Duration::from_secs(DEFAULT_KEEP_ALIVE_TIMEOUT_SECS),
        }
    }
}

/// Session directory server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdServerConfig {
    /// Where to reach the port reservation service.
    pub prs_addr: SocketAddr,
    /// Name the server leases its port under.
    pub service_name: String,
    /// Interval between lease renewals.
    pub keep_alive_interval: Duration,
    /// Local interface to listen on.
    pub bind_ip: IpAddr,
    /// How long to wait for each PRS reply.
    pub response_timeout: Duration,
}

impl SdServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("keep-alive interval"));
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("response timeout"));
        }
        Ok(())
    }
}

impl Default for SdServerConfig {
    fn default() -> Self {
        Self {
            prs_addr: default_prs_addr(),
            service_name: DEFAULT_SD_SERVICE_NAME.to_string(),
            keep_alive_interval: Duration::from_secs(DEFAULT_KEEP_ALIVE_INTERVAL_SECS),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }
}

/// Session directory client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdClientConfig {
    pub prs_addr: SocketAddr,
    /// Host the session server runs on; its port comes from a PRS lookup.
    pub server_ip: IpAddr,
    pub service_name: String,
    pub response_timeout: Duration,
}

impl Default for SdClientConfig {
    fn default() -> Self {
        Self {
            prs_addr: default_prs_addr(),
            server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            service_name: DEFAULT_SD_SERVICE_NAME.to_string(),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }
}

fn default_prs_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PRS_PORT)
}

/// Parse a `<ip>:<port>` pair such as `127.0.0.1:30000`.
pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.trim()
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prs_config_is_valid() {
        let config = PrsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr().port(), DEFAULT_PRS_PORT);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let config = PrsConfig {
            start_port: 40010,
            end_port: 40000,
            ..PrsConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPortRange {
                start: 40010,
                end: 40000
            })
        );
    }

    #[test]
    fn test_single_port_range_is_valid() {
        let config = PrsConfig {
            start_port: 40000,
            end_port: 40000,
            ..PrsConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let prs = PrsConfig {
            keep_alive_timeout: Duration::ZERO,
            ..PrsConfig::default()
        };
        assert!(matches!(prs.validate(), Err(ConfigError::ZeroDuration(_))));

        let sd = SdServerConfig {
            keep_alive_interval: Duration::ZERO,
            ..SdServerConfig::default()
        };
        assert!(matches!(sd.validate(), Err(ConfigError::ZeroDuration(_))));
    }

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:30000").expect("valid address");
        assert_eq!(addr.port(), 30000);
        assert!(matches!(
            parse_socket_addr("127.0.0.1"),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(parse_socket_addr("localhost:port").is_err());
    }
}
