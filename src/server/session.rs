//! Shell and exec sessions for the embedded server.
//!
//! A [`SessionChannel`] tracks one `session` channel: the PTY allocated by
//! `pty-req`, environment collected from `env` requests, and the spawned
//! child once `shell` or `exec` arrives. Child stdout is pumped to the SSH
//! channel from a blocking reader thread; the child's exit code is relayed
//! as `exit-status` before the channel closes.

use std::{io::Read, process::Stdio};

use portable_pty::{CommandBuilder, MasterPty, PtySize, SlavePty, native_pty_system};
use russh::{ChannelId, CryptoVec, server};
use tokio::{io::AsyncWriteExt, process::Command, sync::mpsc};
use tracing::{debug, warn};

use crate::error::{TunnelError, TunnelResult};

pub(super) struct SessionChannel {
    shell: String,
    env: Vec<(String, String)>,
    pty: Option<PtyState>,
    stdin: Option<StdinSink>,
    started: bool,
}

struct PtyState {
    master: Box<dyn MasterPty + Send>,
    slave: Option<Box<dyn SlavePty + Send>>,
    term: String,
}

enum StdinSink {
    Pty(Box<dyn std::io::Write + Send>),
    Pipe(tokio::process::ChildStdin),
}

impl SessionChannel {
    pub(super) fn new(shell: String) -> Self {
        Self {
            shell,
            env: Vec::new(),
            pty: None,
            stdin: None,
            started: false,
        }
    }

    /// Service `pty-req`: allocate a PTY with the requested geometry.
    pub(super) fn allocate_pty(&mut self, term: &str, cols: u32, rows: u32) -> TunnelResult<()> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(pty_error)?;
        self.pty = Some(PtyState {
            master: pair.master,
            slave: Some(pair.slave),
            term: term.to_string(),
        });
        Ok(())
    }

    /// Service `window-change`: resize the allocated PTY.
    pub(super) fn resize(&mut self, cols: u32, rows: u32) -> TunnelResult<()> {
        if let Some(pty) = &self.pty {
            pty.master.resize(pty_size(cols, rows)).map_err(pty_error)?;
        }
        Ok(())
    }

    /// Service `env`: record a variable for the child to inherit.
    pub(super) fn set_env(&mut self, name: &str, value: &str) {
        self.env.push((name.to_string(), value.to_string()));
    }

    /// Service `shell`: spawn the login shell.
    pub(super) fn start_shell(&mut self, channel: ChannelId, handle: server::Handle) -> TunnelResult<()> {
        self.spawn(None, channel, handle)
    }

    /// Service `exec`: spawn a command through the shell.
    pub(super) fn start_exec(&mut self, command: &str, channel: ChannelId, handle: server::Handle) -> TunnelResult<()> {
        self.spawn(Some(command.to_string()), channel, handle)
    }

    /// Forward channel data into the child's stdin.
    pub(super) async fn write_input(&mut self, data: &[u8]) -> TunnelResult<()> {
        match &mut self.stdin {
            Some(StdinSink::Pty(writer)) => {
                writer.write_all(data).map_err(TunnelError::Io)?;
                writer.flush().map_err(TunnelError::Io)?;
            }
            Some(StdinSink::Pipe(stdin)) => {
                stdin.write_all(data).await.map_err(TunnelError::Io)?;
            }
            None => {}
        }
        Ok(())
    }

    /// Channel EOF: close the child's stdin so it can run to completion.
    pub(super) fn close_input(&mut self) {
        self.stdin = None;
    }

    fn spawn(&mut self, command: Option<String>, channel: ChannelId, handle: server::Handle) -> TunnelResult<()> {
        if self.started {
            return Err(TunnelError::channel_open(
                "session",
                "shell or exec already started on this channel",
            ));
        }
        self.started = true;
        if self.pty.is_some() {
            self.spawn_on_pty(command, channel, handle)
        } else {
            self.spawn_piped(command, channel, handle)
        }
    }

    fn spawn_on_pty(&mut self, command: Option<String>, channel: ChannelId, handle: server::Handle) -> TunnelResult<()> {
        let pty = self.pty.as_mut().ok_or_else(|| pty_missing())?;
        let slave = pty.slave.take().ok_or_else(|| pty_missing())?;

        let mut cmd = CommandBuilder::new(&self.shell);
        if let Some(command) = &command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.env("TERM", &pty.term);
        for (name, value) in &self.env {
            cmd.env(name, value);
        }

        let child = slave.spawn_command(cmd).map_err(pty_error)?;
        let reader = pty.master.try_clone_reader().map_err(pty_error)?;
        let writer = pty.master.take_writer().map_err(pty_error)?;
        self.stdin = Some(StdinSink::Pty(writer));

        debug!(shell = %self.shell, command = ?command, "session child spawned on pty");
        pump_pty_output(reader, channel, handle.clone());
        watch_pty_exit(child, channel, handle);
        Ok(())
    }

    fn spawn_piped(&mut self, command: Option<String>, channel: ChannelId, handle: server::Handle) -> TunnelResult<()> {
        let mut cmd = Command::new(&self.shell);
        if let Some(command) = &command {
            cmd.arg("-c").arg(command);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &self.env {
            cmd.env(name, value);
        }

        let mut child = cmd.spawn().map_err(TunnelError::Io)?;
        self.stdin = child.stdin.take().map(StdinSink::Pipe);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        debug!(shell = %self.shell, command = ?command, "session child spawned on pipes");
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;

            let out_handle = handle.clone();
            let out_task = async {
                let Some(mut stdout) = stdout else { return };
                let mut buf = [0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if out_handle.data(channel, CryptoVec::from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            };
            let err_handle = handle.clone();
            let err_task = async {
                let Some(mut stderr) = stderr else { return };
                let mut buf = [0u8; 8192];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if err_handle
                                .extended_data(channel, 1, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            };
            tokio::join!(out_task, err_task);

            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(err) => {
                    warn!(error = %err, "failed to reap session child");
                    1
                }
            };
            debug!(code, "session child exited");
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}

fn pty_size(cols: u32, rows: u32) -> PtySize {
    PtySize {
        rows: rows.clamp(1, u16::MAX as u32) as u16,
        cols: cols.clamp(1, u16::MAX as u32) as u16,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(err: anyhow::Error) -> TunnelError {
    TunnelError::Io(std::io::Error::other(err.to_string()))
}

fn pty_missing() -> TunnelError {
    TunnelError::channel_open("session", "no pty allocated")
}

/// Pump PTY output to the channel. The PTY reader is blocking, so it runs
/// on a plain thread feeding an unbounded queue drained by a tokio task.
fn pump_pty_output(mut reader: Box<dyn Read + Send>, channel: ChannelId, handle: server::Handle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if handle.data(channel, CryptoVec::from_slice(&chunk)).await.is_err() {
                break;
            }
        }
        let _ = handle.eof(channel).await;
    });
}

fn watch_pty_exit(mut child: Box<dyn portable_pty::Child + Send + Sync>, channel: ChannelId, handle: server::Handle) {
    tokio::spawn(async move {
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        let code = match status {
            Ok(Ok(status)) => status.exit_code(),
            _ => 1,
        };
        debug!(code, "session child exited");
        let _ = handle.exit_status_request(channel, code).await;
        let _ = handle.close(channel).await;
    });
}
