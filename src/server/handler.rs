//! Per-connection handler for the embedded SSH server.
//!
//! Authentication is public-key only, checked against the wire-marshalled
//! authorized-key set. After auth, `session` channels are delegated to
//! [`SessionChannel`], `direct-tcpip` channels are dialed and spliced, and
//! `tcpip-forward` global requests get a listener whose accepted
//! connections come back to the peer as `forwarded-tcpip` channels.

use std::{
    collections::{HashMap, HashSet}, net::SocketAddr, sync::Arc
};

use russh::{
    Channel, ChannelId, Pty, keys::{HashAlg, PublicKey, PublicKeyBase64}, server::{self, Auth, Msg, Session}
};
use tokio::{
    net::{TcpListener, TcpStream}, task::JoinHandle
};
use tracing::{debug, info, warn};

use super::session::SessionChannel;
use crate::{
    endpoint::Endpoint, error::TunnelError, tunnel::splice
};

pub(super) struct ServerHandler {
    peer_addr: Option<SocketAddr>,
    authorized: Arc<HashSet<Vec<u8>>>,
    shell: String,
    username: Option<String>,
    key_fingerprint: Option<String>,
    sessions: HashMap<ChannelId, SessionChannel>,
    forward_listeners: HashMap<(String, u32), JoinHandle<()>>,
}

impl ServerHandler {
    pub(super) fn new(peer_addr: Option<SocketAddr>, authorized: Arc<HashSet<Vec<u8>>>, shell: String) -> Self {
        Self {
            peer_addr,
            authorized,
            shell,
            username: None,
            key_fingerprint: None,
            sessions: HashMap::new(),
            forward_listeners: HashMap::new(),
        }
    }

    fn peer(&self) -> String {
        display_addr(self.peer_addr)
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        // remote-forward listeners die with the peer connection
        for ((address, port), task) in self.forward_listeners.drain() {
            debug!(address, port, "closing remote forward listener");
            task.abort();
        }
        info!(
            peer = %display_addr(self.peer_addr),
            user = %self.username.as_deref().unwrap_or("<unauthenticated>"),
            fingerprint = %self.key_fingerprint.as_deref().unwrap_or("<none>"),
            "peer disconnected"
        );
    }
}

impl server::Handler for ServerHandler {
    type Error = TunnelError;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.authorized.contains(&public_key.public_key_bytes()) {
            let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
            info!(peer = %self.peer(), user, fingerprint = %fingerprint, "public key accepted");
            self.username = Some(user.to_string());
            self.key_fingerprint = Some(fingerprint);
            Ok(Auth::Accept)
        } else {
            warn!(peer = %self.peer(), user, "public key not in authorized set");
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer(), channel = ?channel.id(), "session channel opened");
        self.sessions.insert(channel.id(), SessionChannel::new(self.shell.clone()));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = Endpoint::new(host_to_connect, port_to_connect as u16);
        debug!(
            peer = %self.peer(),
            target = %target,
            origin = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip channel requested"
        );
        match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(mut socket) => {
                socket.set_nodelay(true).ok();
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    if let Err(err) = splice(&mut stream, &mut socket).await {
                        debug!(target = %target, error = %err, "direct-tcpip stream closed with error");
                    }
                });
                Ok(true)
            }
            Err(err) => {
                warn!(target = %target, error = %err, "direct-tcpip dial failed");
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let listener = match TcpListener::bind((address, *port as u16)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(peer = %self.peer(), address, port = *port, error = %err, "tcpip-forward bind failed");
                return Ok(false);
            }
        };
        let actual = listener.local_addr().map(|a| a.port() as u32).unwrap_or(*port);
        *port = actual;
        info!(peer = %self.peer(), bind = %format!("{address}:{actual}"), "remote forward listening");

        let task = tokio::spawn(run_forward_listener(listener, session.handle(), address.to_string(), actual));
        if let Some(previous) = self.forward_listeners.insert((address.to_string(), actual), task) {
            previous.abort();
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        match self.forward_listeners.remove(&(address.to_string(), port)) {
            Some(task) => {
                task.abort();
                info!(peer = %self.peer(), address, port, "remote forward cancelled");
                Ok(true)
            }
            None => {
                warn!(peer = %self.peer(), address, port, "cancel for unknown remote forward");
                Ok(false)
            }
        }
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.sessions.get_mut(&channel) {
            Some(state) => match state.allocate_pty(term, col_width, row_height) {
                Ok(()) => session.channel_success(channel)?,
                Err(err) => {
                    warn!(peer = %self.peer(), error = %err, "pty allocation failed");
                    session.channel_failure(channel)?;
                }
            },
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel)
            && let Err(err) = state.resize(col_width, row_height)
        {
            warn!(peer = %self.peer(), error = %err, "pty resize failed");
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel) {
            state.set_env(variable_name, variable_value);
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        match self.sessions.get_mut(&channel) {
            Some(state) => match state.start_shell(channel, session.handle()) {
                Ok(()) => session.channel_success(channel)?,
                Err(err) => {
                    warn!(peer = %self.peer(), error = %err, "shell spawn failed");
                    session.channel_failure(channel)?;
                }
            },
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        match self.sessions.get_mut(&channel) {
            Some(state) => match state.start_exec(&command, channel, session.handle()) {
                Ok(()) => session.channel_success(channel)?,
                Err(err) => {
                    warn!(peer = %self.peer(), command = %command, error = %err, "exec spawn failed");
                    session.channel_failure(channel)?;
                }
            },
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel)
            && let Err(err) = state.write_input(data).await
        {
            debug!(peer = %self.peer(), error = %err, "session input write failed");
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel) {
            state.close_input();
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.sessions.remove(&channel);
        Ok(())
    }
}

/// Accept loop for one `tcpip-forward` registration: every accepted TCP
/// connection becomes a `forwarded-tcpip` channel back to the peer.
async fn run_forward_listener(listener: TcpListener, handle: server::Handle, address: String, port: u32) {
    loop {
        match listener.accept().await {
            Ok((mut socket, origin)) => {
                let handle = handle.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    socket.set_nodelay(true).ok();
                    match handle
                        .channel_open_forwarded_tcpip(address, port, origin.ip().to_string(), origin.port() as u32)
                        .await
                    {
                        Ok(channel) => {
                            let mut stream = channel.into_stream();
                            if let Err(err) = splice(&mut stream, &mut socket).await {
                                debug!(origin = %origin, error = %err, "forwarded stream closed with error");
                            }
                        }
                        Err(err) => warn!(origin = %origin, error = %err, "failed to open forwarded-tcpip channel"),
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "remote forward accept error");
                break;
            }
        }
    }
}

pub(super) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "<unknown>".into())
}
