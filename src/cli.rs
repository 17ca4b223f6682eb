//! Command-line surface. Mechanical: parse flags, validate them, and hand
//! typed configuration records to the client or server side.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use secrecy::SecretString;

use crate::{
    client::{ClientConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_RECONNECT_INTERVAL}, server::ServerConfig, tunnel::{TunnelConfig, parse_forward_spec, parse_reverse_spec}
};

const DEFAULT_SSHD_PORT: u16 = 2222;
const DEFAULT_SHELL: &str = "sh";

#[derive(Debug, Parser)]
#[command(name = "burrow", about = "SSH tunneling daemon and client", version)]
struct RawArgs {
    /// Target server; supports [user@]host[:port] and ssh:// syntax
    #[arg(value_name = "HOST", required_unless_present = "sshd")]
    target: Option<String>,
    /// Override the remote username (defaults to user@host or the local user)
    #[arg(short = 'l', long = "username", value_name = "USER")]
    username: Option<String>,
    /// Private key for public-key authentication
    #[arg(short = 'i', long = "identity", value_name = "KEY")]
    identity: Option<PathBuf>,
    /// Provide the password non-interactively
    #[arg(long, value_name = "PASSWORD")]
    password: Option<String>,
    /// known_hosts file used for host key verification
    #[arg(long = "known-hosts", value_name = "FILE")]
    known_hosts: Option<PathBuf>,
    /// Skip host key verification entirely
    #[arg(long, action = ArgAction::SetTrue)]
    insecure: bool,
    /// Only log errors
    #[arg(short = 'q', long, action = ArgAction::SetTrue)]
    quiet: bool,
    /// Forward a local port; format [bind_address:]port:host:hostport
    #[arg(short = 'L', long = "local-forward", value_name = "SPEC", action = ArgAction::Append)]
    local_forward: Vec<String>,
    /// Forward a remote port back here; format [bind_address:]port:host:hostport
    #[arg(short = 'R', long = "remote-forward", value_name = "SPEC", action = ArgAction::Append)]
    remote_forward: Vec<String>,
    /// Jump host URI, repeatable; hops are traversed in order
    #[arg(short = 'J', long = "jump-host", value_name = "URI", action = ArgAction::Append)]
    jump_hosts: Vec<String>,
    /// Seconds between keep-alive requests (default 5)
    #[arg(long = "keepalive-interval", value_name = "SECONDS")]
    keepalive_interval: Option<u64>,
    /// Seconds between reconnection attempts (default 5)
    #[arg(long = "reconnect-interval", value_name = "SECONDS")]
    reconnect_interval: Option<u64>,
    /// Fetch and print the server host key without storing it, then exit
    #[arg(long = "grab-key", action = ArgAction::SetTrue)]
    grab_key: bool,
    /// Run the embedded SSH server instead of connecting to one
    #[arg(long, action = ArgAction::SetTrue)]
    sshd: bool,
    /// Address the embedded server binds to (defaults to 0.0.0.0)
    #[arg(long = "sshd-bind", value_name = "ADDR", requires = "sshd")]
    sshd_bind: Option<String>,
    /// Port the embedded server listens on (defaults to 2222)
    #[arg(long = "sshd-port", value_name = "PORT", requires = "sshd")]
    sshd_port: Option<u16>,
    /// Server host key file; generated when absent
    #[arg(long = "host-key", value_name = "FILE", requires = "sshd")]
    host_key: Option<PathBuf>,
    /// authorized_keys file with the peers allowed to connect
    #[arg(long = "authorized-keys", value_name = "FILE", requires = "sshd")]
    authorized_keys: Option<PathBuf>,
    /// Shell spawned for session requests (defaults to sh)
    #[arg(long, value_name = "SHELL", requires = "sshd")]
    shell: Option<String>,
}

pub enum Mode {
    Client {
        config: ClientConfig,
        tunnels: Vec<TunnelConfig>,
    },
    GrabKey(ClientConfig),
    Server(ServerConfig),
}

pub struct CliConfig {
    pub quiet: bool,
    pub mode: Mode,
}

impl CliConfig {
    pub fn parse() -> Result<Self> {
        Self::try_from(RawArgs::parse())
    }
}

impl TryFrom<RawArgs> for CliConfig {
    type Error = anyhow::Error;

    fn try_from(args: RawArgs) -> Result<Self> {
        if args.sshd {
            if args.grab_key || !args.local_forward.is_empty() || !args.remote_forward.is_empty() {
                bail!("client options are not supported together with --sshd");
            }
            let config = ServerConfig {
                bind: args.sshd_bind.unwrap_or_else(|| "0.0.0.0".to_string()),
                port: args.sshd_port.unwrap_or(DEFAULT_SSHD_PORT),
                host_key: match args.host_key {
                    Some(path) => path,
                    None => default_ssh_path("id_rsa")?,
                },
                authorized_keys: match args.authorized_keys {
                    Some(path) => path,
                    None => default_ssh_path("authorized_keys")?,
                },
                shell: args.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            };
            return Ok(CliConfig {
                quiet: args.quiet,
                mode: Mode::Server(config),
            });
        }

        let server_url = args.target.context("missing HOST argument")?;
        let config = ClientConfig {
            server_url,
            username: args.username,
            identity: match args.identity {
                Some(path) => path,
                None => default_ssh_path("id_rsa")?,
            },
            password: args
                .password
                .map(|p| SecretString::new(p.into_boxed_str())),
            known_hosts: match args.known_hosts {
                Some(path) => path,
                None => default_ssh_path("known_hosts")?,
            },
            jump_hosts: args.jump_hosts,
            insecure: args.insecure,
            keepalive_interval: args
                .keepalive_interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            reconnect_interval: args
                .reconnect_interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_INTERVAL),
        };

        if args.grab_key {
            return Ok(CliConfig {
                quiet: args.quiet,
                mode: Mode::GrabKey(config),
            });
        }

        let mut tunnels = Vec::new();
        for spec in &args.local_forward {
            tunnels.push(parse_forward_spec(spec).with_context(|| format!("bad --local-forward spec {spec:?}"))?);
        }
        for spec in &args.remote_forward {
            tunnels.push(parse_reverse_spec(spec).with_context(|| format!("bad --remote-forward spec {spec:?}"))?);
        }

        Ok(CliConfig {
            quiet: args.quiet,
            mode: Mode::Client { config, tunnels },
        })
    }
}

fn default_ssh_path(name: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("unable to determine home directory; pass the path explicitly")?;
    Ok(home.join(".ssh").join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliConfig> {
        CliConfig::try_from(RawArgs::try_parse_from(args).expect("clap parse"))
    }

    #[test]
    fn client_mode_collects_tunnels() {
        let cli = parse(&[
            "burrow",
            "user@example.com:2222",
            "-L",
            "18080:127.0.0.1:80",
            "-R",
            "19090:127.0.0.1:8000",
        ])
        .unwrap();
        let Mode::Client { config, tunnels } = cli.mode else {
            panic!("expected client mode");
        };
        assert_eq!(config.server_url, "user@example.com:2222");
        assert_eq!(tunnels.len(), 2);
        assert!(tunnels[0].forward);
        assert!(!tunnels[1].forward);
    }

    #[test]
    fn server_mode_uses_defaults() {
        let cli = parse(&["burrow", "--sshd", "--host-key", "/tmp/hk", "--authorized-keys", "/tmp/ak"]).unwrap();
        let Mode::Server(config) = cli.mode else {
            panic!("expected server mode");
        };
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_SSHD_PORT);
        assert_eq!(config.shell, "sh");
    }

    #[test]
    fn sshd_rejects_client_tunnels() {
        assert!(parse(&["burrow", "--sshd", "-L", "1:2:3"]).is_err());
    }

    #[test]
    fn intervals_default_to_five_seconds() {
        let cli = parse(&["burrow", "example.com"]).unwrap();
        let Mode::Client { config, .. } = cli.mode else {
            panic!("expected client mode");
        };
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
    }
}
