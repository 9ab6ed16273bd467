//! Private DNS server description.

use crate::Error;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// TLS port used when the server string carries no explicit port.
pub const DOT_PORT: u16 = 853;

/// Connect timeouts below this are raised to it.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// One TLS-capable resolver as configured by the host.
///
/// Identity for tracking purposes is (address, name, certificate): a server
/// whose pinned name or CA certificate changes is a different server and
/// must re-validate. The connect timeout is a tuning knob and stays out of
/// identity.
#[derive(Debug, Clone)]
pub struct DotServer {
    /// Server address, port 853 unless configured otherwise.
    pub addr: SocketAddr,

    /// Pinned hostname; empty in opportunistic mode.
    pub name: String,

    /// PEM CA certificate to validate against; empty to use the system
    /// trust store.
    pub ca_cert: String,

    /// TCP connect timeout override, if any.
    pub connect_timeout: Option<Duration>,
}

impl DotServer {
    /// Parses a numeric server address and attaches the TLS parameters.
    ///
    /// `connect_timeout_ms` of zero means "use the transport's default";
    /// positive values are floored at one second.
    pub fn parse(
        server: &str,
        name: &str,
        ca_cert: &str,
        connect_timeout_ms: i32,
    ) -> Result<Self, Error> {
        let addr = server
            .parse::<SocketAddr>()
            .ok()
            .or_else(|| {
                server
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, DOT_PORT))
            })
            .ok_or_else(|| Error::InvalidServer {
                address: server.to_string(),
            })?;

        let connect_timeout = if connect_timeout_ms > 0 {
            Some(Duration::from_millis(connect_timeout_ms as u64).max(MIN_CONNECT_TIMEOUT))
        } else {
            None
        };

        Ok(Self {
            addr,
            name: name.to_string(),
            ca_cert: ca_cert.to_string(),
            connect_timeout,
        })
    }

    fn identity(&self) -> (&SocketAddr, &str, &str) {
        (&self.addr, &self.name, &self.ca_cert)
    }
}

impl PartialEq for DotServer {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for DotServer {}

impl PartialOrd for DotServer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DotServer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Hash for DotServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_applies_default_port() {
        let server = DotServer::parse("1.1.1.1", "", "", 0).unwrap();
        assert_eq!(server.addr, "1.1.1.1:853".parse().unwrap());
        assert_eq!(server.connect_timeout, None);

        let server = DotServer::parse("2606:4700::1111", "one.one.one.one", "", 0).unwrap();
        assert_eq!(server.addr.port(), DOT_PORT);
    }

    #[test]
    fn test_parse_explicit_port() {
        let server = DotServer::parse("1.1.1.1:8853", "", "", 0).unwrap();
        assert_eq!(server.addr.port(), 8853);
    }

    #[test]
    fn test_parse_rejects_hostnames() {
        assert!(DotServer::parse("dns.example.com", "", "", 0).is_err());
    }

    #[test]
    fn test_connect_timeout_floor() {
        let server = DotServer::parse("1.1.1.1", "", "", 250).unwrap();
        assert_eq!(server.connect_timeout, Some(MIN_CONNECT_TIMEOUT));

        let server = DotServer::parse("1.1.1.1", "", "", 4000).unwrap();
        assert_eq!(server.connect_timeout, Some(Duration::from_millis(4000)));
    }

    #[test]
    fn test_identity_excludes_timeout() {
        let a = DotServer::parse("1.1.1.1", "n", "c", 0).unwrap();
        let b = DotServer::parse("1.1.1.1", "n", "c", 5000).unwrap();
        assert_eq!(a, b);

        let c = DotServer::parse("1.1.1.1", "other", "c", 0).unwrap();
        assert_ne!(a, c);
    }
}
