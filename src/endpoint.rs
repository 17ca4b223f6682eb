//! Endpoint and SSH URL parsing.
//!
//! An [`SshUrl`] is the parse of a `[ssh://][user@]host[:port]` string; an
//! [`Endpoint`] is the host/port pair a listener binds to or a dialer
//! connects to. Tunnel specs and jump-host URIs both reduce to these.

use std::fmt;

use crate::error::{TunnelError, TunnelResult};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// A host/port pair, rendered canonically as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host[:port]` string, defaulting the port to 22.
    pub fn parse(input: &str) -> TunnelResult<Self> {
        let url = SshUrl::parse(input)?;
        Ok(Self {
            host: url.host,
            port: url.port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The parse of a full SSH target: optional user, host, port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    pub username: Option<String>,
    pub host: String,
    pub port: u16,
}

impl SshUrl {
    /// Parse `[ssh://][user@]host[:port]`, including bracketed IPv6 hosts.
    pub fn parse(input: &str) -> TunnelResult<Self> {
        let trimmed = input.trim();
        let rest = trimmed.strip_prefix("ssh://").unwrap_or(trimmed);
        if rest.is_empty() {
            return Err(TunnelError::InvalidUrl(input.to_string()));
        }

        let (username, host_part) = match rest.rsplit_once('@') {
            Some((user, host)) if !user.is_empty() => (Some(user.to_string()), host),
            Some((_, host)) => (None, host),
            None => (None, rest),
        };
        if host_part.is_empty() {
            return Err(TunnelError::InvalidUrl(input.to_string()));
        }

        let (host, port) = if host_part.starts_with('[') {
            parse_bracketed_host(host_part).ok_or_else(|| TunnelError::InvalidUrl(input.to_string()))?
        } else if let Some((host, port_str)) = host_part.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| TunnelError::InvalidUrl(input.to_string()))?;
            (host.to_string(), port)
        } else {
            (host_part.to_string(), DEFAULT_SSH_PORT)
        };
        if host.is_empty() {
            return Err(TunnelError::InvalidUrl(input.to_string()));
        }

        Ok(Self {
            username,
            host,
            port,
        })
    }

    /// The endpoint this URL points at, without the user part.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

fn parse_bracketed_host(input: &str) -> Option<(String, u16)> {
    if let Some((host, port)) = input.rsplit_once("]:") {
        let host = host.strip_prefix('[')?;
        let port = port.parse::<u16>().ok()?;
        Some((host.to_string(), port))
    } else {
        let host = input.strip_prefix('[')?.strip_suffix(']')?;
        Some((host.to_string(), DEFAULT_SSH_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let url = SshUrl::parse("example.com").unwrap();
        assert_eq!(url.username, None);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 22);
    }

    #[test]
    fn parses_user_host_port() {
        let url = SshUrl::parse("deploy@example.com:2222").unwrap();
        assert_eq!(url.username.as_deref(), Some("deploy"));
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 2222);
    }

    #[test]
    fn parses_scheme_prefix() {
        let url = SshUrl::parse("ssh://root@10.0.0.1:2200").unwrap();
        assert_eq!(url.username.as_deref(), Some("root"));
        assert_eq!(url.host, "10.0.0.1");
        assert_eq!(url.port, 2200);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let url = SshUrl::parse("admin@[::1]:2222").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 2222);

        let url = SshUrl::parse("[fe80::1]").unwrap();
        assert_eq!(url.host, "fe80::1");
        assert_eq!(url.port, 22);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(SshUrl::parse("").is_err());
        assert!(SshUrl::parse("host:notaport").is_err());
        assert!(SshUrl::parse("user@").is_err());
        assert!(SshUrl::parse("host:99999").is_err());
    }

    #[test]
    fn endpoint_display_round_trips() {
        for input in ["localhost:8080", "example.com:22", "10.1.2.3:443"] {
            let endpoint = Endpoint::parse(input).unwrap();
            assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }

    #[test]
    fn endpoint_defaults_port() {
        let endpoint = Endpoint::parse("example.com").unwrap();
        assert_eq!(endpoint.to_string(), "example.com:22");
    }
}
