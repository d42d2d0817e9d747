use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;

use crate::settings::TelemetrySettings;

/// Answers "is the outside world reachable right now". Any failure is `false`.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// TCP connect to a well-known address with a bounded timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self::new(settings.probe_address.clone(), settings.probe_timeout())
    }
}

impl ReachabilityProbe for TcpProbe {
    fn is_reachable(&self) -> bool {
        let addrs = match self.address.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!("probe address {} did not resolve: {err}", self.address);
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(err) => debug!("probe to {addr} failed: {err}"),
            }
        }
        false
    }
}
