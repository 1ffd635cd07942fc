//! Upstream endpoint identity

use crate::{Error, Result};
use std::fmt;
use std::net::IpAddr;

/// A `host:port` pair identifying an upstream endpoint.
///
/// Server connections are keyed by their dial authority, so equality and
/// hashing follow the textual host plus the port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    host: String,
    port: u16,
}

impl Authority {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Authority {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`, falling back to
    /// `default_port` when no port is given.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::bad_request("empty authority"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6 literal
            let close = rest
                .find(']')
                .ok_or_else(|| Error::bad_request(format!("unclosed IPv6 literal: {}", s)))?;
            let host = &rest[..close];
            let port = match rest[close + 1..].strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::bad_request(format!("invalid port in {}", s)))?,
                None => default_port,
            };
            return Ok(Authority::new(host, port));
        }

        match s.rfind(':') {
            // A second colon means a bare IPv6 address without a port
            Some(idx) if !s[..idx].contains(':') => {
                let port = s[idx + 1..]
                    .parse()
                    .map_err(|_| Error::bad_request(format!("invalid port in {}", s)))?;
                Ok(Authority::new(&s[..idx], port))
            }
            _ => Ok(Authority::new(s, default_port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the host is an IP literal and needs no name resolution.
    pub fn is_numeric(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
