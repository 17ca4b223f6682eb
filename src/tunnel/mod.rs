//! The tunnel engine: forward and reverse TCP tunnels over a managed
//! SSH session.
//!
//! A forward tunnel owns a local listener and opens a `direct-tcpip`
//! channel per accepted connection. A reverse tunnel registers a
//! `tcpip-forward` on the remote server and services the `forwarded-tcpip`
//! channels the server opens back; registrations are re-installed on every
//! fresh session. Both splice bytes with [`splice`], which preserves
//! half-close so request/response protocols terminate cleanly.

use std::{net::SocketAddr, sync::Arc};

use russh::{Channel, client};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy_bidirectional_with_sizes}, net::{TcpListener, TcpStream}, sync::Mutex
};
use tracing::{debug, info, warn};

use crate::{
    client::ConnectionManager, endpoint::Endpoint, error::{TunnelError, TunnelResult}
};

/// One tunnel to run: a listener endpoint paired with a dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// true = forward (listen locally), false = reverse (listen remotely)
    pub forward: bool,
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// Parse a forward tunnel spec: `[bind_address:]port:host:hostport`.
/// The listener side defaults to loopback.
pub fn parse_forward_spec(spec: &str) -> TunnelResult<TunnelConfig> {
    let (bind, target) = parse_pair_spec(spec)?;
    Ok(TunnelConfig {
        forward: true,
        local: bind,
        remote: target,
    })
}

/// Parse a reverse tunnel spec: `[bind_address:]port:host:hostport`, where
/// the bind side is the remote listener and the target is dialed locally.
pub fn parse_reverse_spec(spec: &str) -> TunnelResult<TunnelConfig> {
    let (bind, target) = parse_pair_spec(spec)?;
    Ok(TunnelConfig {
        forward: false,
        local: target,
        remote: bind,
    })
}

fn parse_pair_spec(spec: &str) -> TunnelResult<(Endpoint, Endpoint)> {
    let fields = split_spec(spec);
    match fields.len() {
        4 => Ok((
            Endpoint::new(fields[0].clone(), parse_port(&fields[1], spec)?),
            Endpoint::new(fields[2].clone(), parse_port(&fields[3], spec)?),
        )),
        3 => Ok((
            Endpoint::new("127.0.0.1", parse_port(&fields[0], spec)?),
            Endpoint::new(fields[1].clone(), parse_port(&fields[2], spec)?),
        )),
        _ => Err(TunnelError::InvalidUrl(spec.to_string())),
    }
}

fn parse_port(value: &str, spec: &str) -> TunnelResult<u16> {
    value
        .parse::<u16>()
        .map_err(|_| TunnelError::InvalidUrl(spec.to_string()))
}

// Split on colons, keeping bracketed IPv6 literals intact.
fn split_spec(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for ch in input.chars() {
        match ch {
            ':' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// A forward or reverse tunnel bound to a connection manager.
pub struct Tunnel {
    config: TunnelConfig,
    manager: Arc<ConnectionManager>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig, manager: Arc<ConnectionManager>) -> Self {
        Self { config, manager }
    }

    pub fn forward(local: Endpoint, remote: Endpoint, manager: Arc<ConnectionManager>) -> Self {
        Self::new(
            TunnelConfig {
                forward: true,
                local,
                remote,
            },
            manager,
        )
    }

    pub fn reverse(remote: Endpoint, local: Endpoint, manager: Arc<ConnectionManager>) -> Self {
        Self::new(
            TunnelConfig {
                forward: false,
                local,
                remote,
            },
            manager,
        )
    }

    /// Drive the tunnel until the manager stops. For a forward tunnel a
    /// bind failure is returned; everything later is per-stream and only
    /// reaps that stream.
    pub async fn run(self) -> TunnelResult<()> {
        if self.config.forward {
            run_forward(self.manager, self.config.local, self.config.remote).await
        } else {
            run_reverse(self.manager, self.config.remote, self.config.local).await
        }
    }
}

async fn run_forward(manager: Arc<ConnectionManager>, local: Endpoint, remote: Endpoint) -> TunnelResult<()> {
    let listener = TcpListener::bind((local.host.as_str(), local.port))
        .await
        .map_err(|e| TunnelError::bind(local.to_string(), e))?;
    info!(bind = %local, target = %remote, "forward tunnel listening");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(bind = %local, error = %err, "forward tunnel accept error");
                break Ok(());
            }
        };
        // accepts are not serviced until the carrier session is up
        if manager.wait_ready().await.is_err() {
            info!(bind = %local, "forward tunnel stopped");
            break Ok(());
        }
        let manager = manager.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, target = %remote, "forwarding connection");
            if let Err(err) = forward_connection(manager, socket, peer, &remote).await {
                debug!(target = %remote, error = %err, "forward stream closed with error");
            }
        });
    }
}

async fn forward_connection(
    manager: Arc<ConnectionManager>,
    mut socket: TcpStream,
    peer: SocketAddr,
    remote: &Endpoint,
) -> TunnelResult<()> {
    socket.set_nodelay(true).ok();
    let mut stream = manager
        .open_direct_tcpip(remote, (peer.ip().to_string(), peer.port()))
        .await?;
    splice(&mut socket, &mut stream).await
}

async fn run_reverse(manager: Arc<ConnectionManager>, remote: Endpoint, local: Endpoint) -> TunnelResult<()> {
    loop {
        if manager.wait_ready().await.is_err() {
            info!(remote = %remote, "reverse tunnel stopped");
            return Ok(());
        }
        manager.registry().register(remote.clone(), local.clone()).await;
        match manager.request_tcpip_forward(&remote).await {
            Ok(assigned) => {
                info!(remote = %remote, assigned, target = %local, "reverse tunnel registered")
            }
            Err(err) => warn!(remote = %remote, error = %err, "reverse tunnel registration failed"),
        }

        // the remote listener dies with the session; wait and re-register
        manager.wait_lost().await;
        manager.registry().unregister(&remote).await;
        if manager.is_stopped() {
            info!(remote = %remote, "reverse tunnel stopped");
            return Ok(());
        }
        debug!(remote = %remote, "session lost, reverse tunnel waiting to re-register");
    }
}

struct ReverseBinding {
    remote: Endpoint,
    local: Endpoint,
}

/// Table of active reverse-tunnel registrations, consulted when the server
/// opens a `forwarded-tcpip` channel back to us.
#[derive(Default)]
pub struct ReverseRegistry {
    bindings: Mutex<Vec<ReverseBinding>>,
}

impl ReverseRegistry {
    pub async fn register(&self, remote: Endpoint, local: Endpoint) {
        self.bindings.lock().await.push(ReverseBinding { remote, local });
    }

    pub async fn unregister(&self, remote: &Endpoint) {
        self.bindings.lock().await.retain(|b| &b.remote != remote);
    }

    /// Match an inbound channel's bound address/port to a local target.
    pub async fn resolve(&self, address: &str, port: u32) -> Option<Endpoint> {
        let bindings = self.bindings.lock().await;
        bindings.iter().find_map(|binding| {
            if binding.remote.port as u32 != port {
                return None;
            }
            let wildcard = matches!(binding.remote.host.as_str(), "" | "0.0.0.0" | "::");
            if wildcard || binding.remote.host == address {
                Some(binding.local.clone())
            } else {
                None
            }
        })
    }

    /// Dial the registered local target and splice it to the channel.
    /// Channels with no matching registration are closed.
    pub async fn dispatch(&self, channel: Channel<client::Msg>, address: &str, port: u32) -> TunnelResult<()> {
        let Some(local) = self.resolve(address, port).await else {
            warn!(
                bind = %format!("{address}:{port}"),
                "forwarded-tcpip channel with no matching reverse tunnel"
            );
            let _ = channel.close().await;
            return Ok(());
        };
        let mut socket = TcpStream::connect((local.host.as_str(), local.port))
            .await
            .map_err(|e| TunnelError::dial(local.to_string(), e))?;
        socket.set_nodelay(true).ok();
        let mut stream = channel.into_stream();
        splice(&mut stream, &mut socket).await
    }
}

const SPLICE_BUF: usize = 32 * 1024;

/// Pump bytes both ways until each direction has seen EOF, then shut both
/// ends down. Common half-close races are treated as graceful termination.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> TunnelResult<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let copy_result = copy_bidirectional_with_sizes(a, b, SPLICE_BUF, SPLICE_BUF).await;
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    match copy_result {
        Ok(_) => Ok(()),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forward_spec_with_bind_host() {
        let config = parse_forward_spec("0.0.0.0:8080:service:80").unwrap();
        assert!(config.forward);
        assert_eq!(config.local, Endpoint::new("0.0.0.0", 8080));
        assert_eq!(config.remote, Endpoint::new("service", 80));
    }

    #[test]
    fn parses_forward_spec_defaulting_to_loopback() {
        let config = parse_forward_spec("18080:127.0.0.1:80").unwrap();
        assert_eq!(config.local, Endpoint::new("127.0.0.1", 18080));
        assert_eq!(config.remote, Endpoint::new("127.0.0.1", 80));
    }

    #[test]
    fn parses_reverse_spec_swapping_sides() {
        let config = parse_reverse_spec("19090:localhost:8000").unwrap();
        assert!(!config.forward);
        assert_eq!(config.remote, Endpoint::new("127.0.0.1", 19090));
        assert_eq!(config.local, Endpoint::new("localhost", 8000));
    }

    #[test]
    fn parses_bracketed_ipv6_spec() {
        let config = parse_forward_spec("[::1]:8080:[fe80::2]:443").unwrap();
        assert_eq!(config.local, Endpoint::new("::1", 8080));
        assert_eq!(config.remote, Endpoint::new("fe80::2", 443));
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(parse_forward_spec("8080").is_err());
        assert!(parse_forward_spec("host:notaport:target:80").is_err());
        assert!(parse_forward_spec("a:b:c:d:e").is_err());
    }

    #[tokio::test]
    async fn registry_resolves_matching_binding() {
        let registry = ReverseRegistry::default();
        registry
            .register(Endpoint::new("127.0.0.1", 19090), Endpoint::new("127.0.0.1", 8000))
            .await;

        assert_eq!(
            registry.resolve("127.0.0.1", 19090).await,
            Some(Endpoint::new("127.0.0.1", 8000))
        );
        assert_eq!(registry.resolve("127.0.0.1", 19091).await, None);
        assert_eq!(registry.resolve("10.0.0.1", 19090).await, None);
    }

    #[tokio::test]
    async fn registry_wildcard_binding_matches_any_address() {
        let registry = ReverseRegistry::default();
        registry
            .register(Endpoint::new("0.0.0.0", 7000), Endpoint::new("127.0.0.1", 7001))
            .await;

        assert_eq!(
            registry.resolve("192.0.2.10", 7000).await,
            Some(Endpoint::new("127.0.0.1", 7001))
        );
    }

    #[tokio::test]
    async fn registry_unregister_clears_binding() {
        let registry = ReverseRegistry::default();
        let remote = Endpoint::new("127.0.0.1", 19090);
        registry.register(remote.clone(), Endpoint::new("127.0.0.1", 8000)).await;
        registry.unregister(&remote).await;
        assert_eq!(registry.resolve("127.0.0.1", 19090).await, None);
    }
}
