//! Embedded SSH server entry point and module wiring.
//!
//! `run_server` loads the host key and authorized-key set, configures
//! russh for public-key auth only, and hands each accepted connection to
//! [`handler::ServerHandler`].

mod handler;
mod session;

use std::{
    collections::HashSet, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration
};

use russh::{
    MethodKind, MethodSet, server::{self as ssh_server, Server as _}
};
use tracing::{info, warn};

use crate::{
    error::{TunnelError, TunnelResult}, keys
};
use handler::{ServerHandler, display_addr};

/// Parsed server-side configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub host_key: PathBuf,
    pub authorized_keys: PathBuf,
    /// Shell spawned for `shell` and `exec` session requests
    pub shell: String,
}

/// Launch the embedded SSH server and block on its accept loop.
pub async fn run_server(config: ServerConfig) -> TunnelResult<()> {
    let host_key = keys::load_or_create_host_key(&config.host_key)?;
    let authorized = Arc::new(keys::load_authorized_keys(&config.authorized_keys)?);
    if authorized.is_empty() {
        warn!(
            path = %config.authorized_keys.display(),
            "authorized_keys is empty: every public key will be rejected"
        );
    }

    let mut server_config = ssh_server::Config {
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        nodelay: true,
        ..Default::default()
    };
    server_config.methods = MethodSet::empty();
    server_config.methods.push(MethodKind::PublicKey);
    server_config.keys.push(host_key);

    let mut server = TunnelServer {
        authorized,
        shell: config.shell.clone(),
    };
    info!(bind = %config.bind, port = config.port, "starting embedded SSH server");
    server
        .run_on_address(Arc::new(server_config), (config.bind.as_str(), config.port))
        .await
        .map_err(|e| TunnelError::bind(format!("{}:{}", config.bind, config.port), e))?;
    Ok(())
}

/// Factory invoked by russh whenever a peer connects.
struct TunnelServer {
    authorized: Arc<HashSet<Vec<u8>>>,
    shell: String,
}

impl ssh_server::Server for TunnelServer {
    type Handler = ServerHandler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = %display_addr(addr), "peer connected");
        ServerHandler::new(addr, self.authorized.clone(), self.shell.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as ssh_server::Handler>::Error) {
        warn!(error = %error, "peer session ended with error");
    }
}
