//! Rendezvous address discovery for the process group

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use tracing::info;
use uuid::Uuid;

/// First port probed when no `MASTER_PORT` is set.
pub const DEFAULT_BASE_PORT: u16 = 29500;

pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
pub const MASTER_PORT_ENV: &str = "MASTER_PORT";

/// Address/port pair every rank uses to join one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendezvous {
    pub addr: String,
    pub port: u16,
    /// Distinguishes this group from any other fleet on the same host
    pub group_id: Uuid,
}

impl Rendezvous {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            group_id: Uuid::new_v4(),
        }
    }

    /// Bind the leader's listener, honoring `MASTER_ADDR`/`MASTER_PORT` when set.
    ///
    /// Without `MASTER_PORT` the first free port at or above
    /// [`DEFAULT_BASE_PORT`] is taken. The listener is returned still bound so
    /// no other process can claim the port before the group forms.
    pub fn bind_leader() -> Result<(Self, TcpListener)> {
        let addr = std::env::var(MASTER_ADDR_ENV).unwrap_or_else(|_| "127.0.0.1".to_string());
        let (port, listener) = match std::env::var(MASTER_PORT_ENV) {
            Ok(port) => {
                let port: u16 = port.parse().map_err(|_| {
                    AgentError::Config(format!("{} is not a port: {}", MASTER_PORT_ENV, port))
                })?;
                let listener = TcpListener::bind((addr.as_str(), port))?;
                (port, listener)
            }
            Err(_) => find_available_port(&addr, DEFAULT_BASE_PORT)?,
        };
        info!(master_addr = %addr, master_port = port, "Process group rendezvous");
        Ok((Self::new(addr, port), listener))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.addr.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                AgentError::Config(format!("Cannot resolve {}:{}", self.addr, self.port))
            })
    }
}

/// Bind the first free port at or above `start`.
pub fn find_available_port(addr: &str, start: u16) -> Result<(u16, TcpListener)> {
    for port in start..=u16::MAX {
        if let Ok(listener) = TcpListener::bind((addr, port)) {
            return Ok((port, listener));
        }
    }
    Err(AgentError::Network(format!(
        "No free port on {} at or above {}",
        addr, start
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_available_port_skips_taken() {
        let (first, _held) = find_available_port("127.0.0.1", 31500).unwrap();
        let (second, _held2) = find_available_port("127.0.0.1", first).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_socket_addr_resolves() {
        let rdzv = Rendezvous::new("127.0.0.1", 29999);
        assert_eq!(rdzv.socket_addr().unwrap().port(), 29999);
    }

    #[test]
    fn test_group_ids_are_unique() {
        assert_ne!(
            Rendezvous::new("127.0.0.1", 1).group_id,
            Rendezvous::new("127.0.0.1", 1).group_id
        );
    }
}
