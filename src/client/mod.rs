//! SSH connection lifetime management.
//!
//! [`ConnectionManager`] owns the client side of the daemon: it dials the
//! configured server (directly or through a chain of jump hosts), keeps the
//! session alive with periodic keep-alive requests, and reconnects with a
//! fixed backoff when the session dies. Tunnels never hold the session
//! themselves; they wait on the manager's readiness latch and snapshot the
//! active handle for one operation at a time.

mod auth;
pub mod hostkeys;

use std::{
    path::PathBuf, sync::{
        Arc, atomic::{AtomicBool, Ordering}
    }, time::Duration
};

use russh::{
    Channel, ChannelStream, Disconnect, client::{self, Handle}, keys::PublicKey
};
use secrecy::SecretString;
use tokio::{
    net::TcpStream, sync::{RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard, watch}, time
};
use tracing::{debug, info, warn};

use crate::{
    endpoint::{Endpoint, SshUrl}, error::{TunnelError, TunnelResult}, tunnel::ReverseRegistry
};
use auth::{AuthConfig, authenticate};
use hostkeys::{HostKeyPolicy, KnownHostsStore};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Parsed client-side configuration consumed by the manager.
#[derive(Clone)]
pub struct ClientConfig {
    /// Target server as `[user@]host[:port]`
    pub server_url: String,
    /// Username override; falls back to the URL user, then the local user
    pub username: Option<String>,
    pub identity: PathBuf,
    pub password: Option<SecretString>,
    pub known_hosts: PathBuf,
    /// Jump-host URIs, traversed in order
    pub jump_hosts: Vec<String>,
    pub insecure: bool,
    pub keepalive_interval: Duration,
    pub reconnect_interval: Duration,
}

/// Lifecycle state of the managed SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closed,
}

/// The live session plus the jump-host handles that carry it. Dropping a
/// hop handle tears down the tunnelled transport, so they live and die with
/// the terminal session.
struct ActiveClient {
    handle: Handle<ClientHandler>,
    _hops: Vec<Handle<ClientHandler>>,
}

pub struct ConnectionManager {
    server: Endpoint,
    username: String,
    auth: AuthConfig,
    jump_hosts: Vec<String>,
    hostkeys: HostKeyPolicy,
    keepalive_interval: Duration,
    reconnect_interval: Duration,
    client: RwLock<Option<ActiveClient>>,
    status_tx: watch::Sender<ConnectionStatus>,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
    registry: Arc<ReverseRegistry>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> TunnelResult<Self> {
        let url = SshUrl::parse(&config.server_url)?;
        let username = config
            .username
            .or(url.username.clone())
            .unwrap_or_else(whoami::username);

        let hostkeys = if config.insecure {
            warn!("host key verification disabled");
            HostKeyPolicy::Insecure
        } else {
            HostKeyPolicy::Strict {
                store: Arc::new(KnownHostsStore::open(&config.known_hosts)?),
                record: true,
            }
        };

        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            server: url.endpoint(),
            username,
            auth: AuthConfig {
                identity: config.identity,
                password: config.password,
            },
            jump_hosts: config.jump_hosts,
            hostkeys,
            keepalive_interval: config.keepalive_interval,
            reconnect_interval: config.reconnect_interval,
            client: RwLock::new(None),
            status_tx,
            stop_tx,
            running: AtomicBool::new(false),
            registry: Arc::new(ReverseRegistry::default()),
        })
    }

    /// The registry reverse tunnels record their bindings in; inbound
    /// `forwarded-tcpip` channels are matched against it.
    pub fn registry(&self) -> Arc<ReverseRegistry> {
        self.registry.clone()
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// Begin the supervision loop in the background. A second call while
    /// the loop is alive is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(false);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run().await;
            manager.running.store(false, Ordering::SeqCst);
        });
    }

    /// Signal termination and close the current session. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.reset_conn().await;
        self.set_status(ConnectionStatus::Closed);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Block until the session is established. Returns `Stopped` when the
    /// manager is shut down instead; callers re-enter after any disconnect.
    pub async fn wait_ready(&self) -> TunnelResult<()> {
        let mut status_rx = self.status_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow_and_update() {
                return Err(TunnelError::Stopped);
            }
            if *status_rx.borrow_and_update() == ConnectionStatus::Connected {
                return Ok(());
            }
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(TunnelError::Stopped);
                    }
                }
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// Block until the session is lost (or the manager stops).
    pub async fn wait_lost(&self) {
        let mut status_rx = self.status_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow_and_update() || *status_rx.borrow_and_update() != ConnectionStatus::Connected {
                return;
            }
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// Snapshot the active client handle for one operation.
    pub async fn client(&self) -> TunnelResult<RwLockReadGuard<'_, Handle<ClientHandler>>> {
        let guard = self.client.read().await;
        RwLockReadGuard::try_map(guard, |slot| slot.as_ref().map(|active| &active.handle))
            .map_err(|_| TunnelError::NotConnected)
    }

    async fn client_mut(&self) -> TunnelResult<RwLockMappedWriteGuard<'_, Handle<ClientHandler>>> {
        let guard = self.client.write().await;
        RwLockWriteGuard::try_map(guard, |slot| slot.as_mut().map(|active| &mut active.handle))
            .map_err(|_| TunnelError::NotConnected)
    }

    /// Open a `direct-tcpip` channel to `target` on the active session.
    pub async fn open_direct_tcpip(
        &self,
        target: &Endpoint,
        origin: (String, u16),
    ) -> TunnelResult<ChannelStream<client::Msg>> {
        let client = self.client().await?;
        let channel = client
            .channel_open_direct_tcpip(target.host.clone(), target.port as u32, origin.0, origin.1 as u32)
            .await
            .map_err(|e| TunnelError::channel_open(target.to_string(), e.to_string()))?;
        Ok(channel.into_stream())
    }

    /// Ask the remote server to listen on `remote` and deliver accepted
    /// connections back as `forwarded-tcpip` channels.
    pub async fn request_tcpip_forward(&self, remote: &Endpoint) -> TunnelResult<u32> {
        let mut client = self.client_mut().await?;
        let assigned = client
            .tcpip_forward(remote.host.clone(), remote.port as u32)
            .await?;
        Ok(assigned)
    }

    async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);
            match self.connect_once().await {
                Err(err) => {
                    warn!(
                        server = %self.server,
                        error = %err,
                        retry_in = ?self.reconnect_interval,
                        "connection attempt failed"
                    );
                    tokio::select! {
                        _ = time::sleep(self.reconnect_interval) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
                Ok(active) => {
                    *self.client.write().await = Some(active);
                    self.set_status(ConnectionStatus::Connected);
                    info!(server = %self.server, "connected");

                    // blocks until the session dies or stop is requested
                    self.keep_alive(stop_rx.clone()).await;

                    self.reset_conn().await;
                    self.set_status(ConnectionStatus::Closed);
                }
            }
        }
        self.reset_conn().await;
        self.set_status(ConnectionStatus::Closed);
    }

    async fn connect_once(&self) -> TunnelResult<ActiveClient> {
        let config = Arc::new(client::Config {
            nodelay: true,
            inactivity_timeout: None,
            ..Default::default()
        });

        let Some((first, rest)) = self.jump_hosts.split_first() else {
            let handle = self.dial_direct(&config, &self.server, &self.username).await?;
            return Ok(ActiveClient {
                handle,
                _hops: Vec::new(),
            });
        };

        let first_url = SshUrl::parse(first)?;
        let mut current = self
            .dial_direct(&config, &first_url.endpoint(), hop_user(&first_url, &self.username))
            .await?;
        let mut hops = Vec::new();
        for uri in rest {
            let url = SshUrl::parse(uri)?;
            let next = self
                .dial_via(&config, &current, &url.endpoint(), hop_user(&url, &self.username))
                .await?;
            hops.push(std::mem::replace(&mut current, next));
        }

        let handle = self.dial_via(&config, &current, &self.server, &self.username).await?;
        hops.push(current);
        Ok(ActiveClient { handle, _hops: hops })
    }

    async fn dial_direct(
        &self,
        config: &Arc<client::Config>,
        endpoint: &Endpoint,
        username: &str,
    ) -> TunnelResult<Handle<ClientHandler>> {
        info!(target = %endpoint, user = username, "dialing SSH server");
        let socket = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TunnelError::dial(endpoint.to_string(), e))?;
        socket.set_nodelay(true).ok();
        let mut handle = client::connect_stream(config.clone(), socket, self.handler_for(endpoint)).await?;
        authenticate(&mut handle, username, &self.auth).await?;
        Ok(handle)
    }

    async fn dial_via(
        &self,
        config: &Arc<client::Config>,
        via: &Handle<ClientHandler>,
        endpoint: &Endpoint,
        username: &str,
    ) -> TunnelResult<Handle<ClientHandler>> {
        info!(target = %endpoint, user = username, "dialing through jump host");
        let stream = via
            .channel_open_direct_tcpip(endpoint.host.clone(), endpoint.port as u32, "127.0.0.1".to_string(), 0)
            .await
            .map_err(|e| TunnelError::channel_open(endpoint.to_string(), e.to_string()))?
            .into_stream();
        let mut handle = client::connect_stream(config.clone(), stream, self.handler_for(endpoint)).await?;
        authenticate(&mut handle, username, &self.auth).await?;
        Ok(handle)
    }

    fn handler_for(&self, endpoint: &Endpoint) -> ClientHandler {
        ClientHandler {
            host: endpoint.host.clone(),
            port: endpoint.port,
            policy: self.hostkeys.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Send keep-alive requests until one fails. A send failure means the
    /// carrier session is gone and the supervision loop should reconnect.
    async fn keep_alive(&self, mut stop_rx: watch::Receiver<bool>) {
        debug!("starting keep-alive loop");
        loop {
            {
                let mut guard = self.client.write().await;
                let Some(active) = guard.as_mut() else {
                    return;
                };
                if let Err(err) = active.handle.send_keepalive(true).await {
                    warn!(error = %err, "keep-alive failed, tearing down session");
                    return;
                }
            }
            tokio::select! {
                _ = time::sleep(self.keepalive_interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn reset_conn(&self) {
        let active = self.client.write().await.take();
        if let Some(mut active) = active {
            let _ = active
                .handle
                .disconnect(Disconnect::ByApplication, "", "")
                .await;
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(?status, "connection status changed");
        }
    }
}

fn hop_user<'a>(url: &'a SshUrl, fallback: &'a str) -> &'a str {
    url.username.as_deref().unwrap_or(fallback)
}

/// Dial once with a non-recording verifier, purely to surface the server's
/// host key fingerprint to the operator. Authentication is never attempted.
pub async fn grab_host_key(config: &ClientConfig) -> TunnelResult<()> {
    let url = SshUrl::parse(&config.server_url)?;
    let endpoint = url.endpoint();
    let store = Arc::new(KnownHostsStore::open(&config.known_hosts)?);
    let handler = ClientHandler {
        host: endpoint.host.clone(),
        port: endpoint.port,
        policy: HostKeyPolicy::Strict { store, record: false },
        registry: Arc::new(ReverseRegistry::default()),
    };

    let socket = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TunnelError::dial(endpoint.to_string(), e))?;
    let ssh_config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(ssh_config, socket, handler).await?;
    let _ = handle.disconnect(Disconnect::ByApplication, "", "").await;
    Ok(())
}

/// russh callback handler shared by every hop of a connection.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    registry: Arc<ReverseRegistry>,
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.policy.check(&self.host, self.port, server_public_key)
    }

    /// Invoked when the remote side delivers a connection accepted on one
    /// of our reverse-tunnel listeners.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            bind = %format!("{connected_address}:{connected_port}"),
            origin = %format!("{originator_address}:{originator_port}"),
            "inbound forwarded-tcpip channel"
        );
        let registry = self.registry.clone();
        let address = connected_address.to_string();
        tokio::spawn(async move {
            if let Err(err) = registry.dispatch(channel, &address, connected_port).await {
                warn!(error = %err, "forwarded connection failed");
            }
        });
        Ok(())
    }
}
