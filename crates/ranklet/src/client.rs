//! Tool-side handle on a supervisor daemon.
//!
//! One request in flight at a time: every method takes `&mut self`, writes a
//! request, and blocks on the matching response. Daemon-side operation
//! failures surface as [`OperationError`]; a response of the wrong shape is
//! a [`ProtocolError`] and the connection should be discarded.

use std::os::fd::{AsRawFd, RawFd};
use std::process::Stdio;

use crate::bridge::codec::Channel;
use crate::bridge::protocol::{AppId, LaunchSpec, MpirData, Request, Response, RunMode, StdioSlots};
use crate::bridge::transport::{SocketPairTransport, Transport};
use crate::error::{Error, OperationError, ProtocolError, Result, TransportError};

/// The daemon finds its control socket on this fd.
pub const CONTROL_FD: RawFd = 3;
/// Names the control fd in the daemon's environment.
pub const CONTROL_FD_ENV: &str = "RANKLET_CONTROL_FD";
/// Overrides the daemon binary path (tests, non-PATH installs).
pub const DAEMON_PATH_ENV: &str = "RANKLET_DAEMON_PATH";

const DAEMON_BIN: &str = "ranklet-daemon";

/// Outcome of a utility launch; shape depends on the requested run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilStatus {
    /// Asynchronous launch: the utility is running.
    Started { pid: i32 },
    /// Synchronous launch: the utility ran to completion.
    Exited { success: bool },
}

/// A connected client of one `ranklet-daemon`.
pub struct DaemonClient<T = SocketPairTransport> {
    channel: Channel<T>,
    daemon_pid: i32,
    child: Option<tokio::process::Child>,
}

impl DaemonClient<SocketPairTransport> {
    /// Fork/exec a daemon connected over a private socketpair and complete
    /// its startup handshake.
    pub async fn spawn() -> Result<Self> {
        let (transport, theirs) = SocketPairTransport::pair().map_err(TransportError::Io)?;

        let path =
            std::env::var(DAEMON_PATH_ENV).unwrap_or_else(|_| DAEMON_BIN.to_string());
        let mut cmd = tokio::process::Command::new(&path);
        cmd.env(CONTROL_FD_ENV, CONTROL_FD.to_string())
            .stdin(Stdio::null());

        // `theirs` is CLOEXEC; pin it to the well-known fd in the child.
        // dup2 clears the flag on the duplicate, so only that copy survives
        // the exec.
        let raw = theirs.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                // Keeps the socket open until the child is past exec.
                let _ = &theirs;
                if raw == CONTROL_FD {
                    // dup2 onto itself would leave CLOEXEC set.
                    let flags = nix::libc::fcntl(raw, nix::libc::F_GETFD);
                    if flags < 0
                        || nix::libc::fcntl(raw, nix::libc::F_SETFD, flags & !nix::libc::FD_CLOEXEC)
                            < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if nix::libc::dup2(raw, CONTROL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            Error::Operation(OperationError::new(format!(
                "failed to spawn {path}: {e}"
            )))
        })?;
        tracing::debug!(path, "daemon spawned");

        let mut client = Self::handshake(transport).await?;
        client.child = Some(child);
        Ok(client)
    }
}

impl<T: Transport> DaemonClient<T> {
    /// Connect over an existing transport (remote relays, tests) and
    /// complete the startup handshake.
    pub async fn over(transport: T) -> Result<Self> {
        Self::handshake(transport).await
    }

    async fn handshake(transport: T) -> Result<Self> {
        let mut channel = Channel::new(transport);
        let daemon_pid = match channel.recv_response().await? {
            Response::Pid { pid } if pid > 0 => pid,
            other => return Err(unexpected("Pid", &other)),
        };
        tracing::debug!(daemon_pid, "daemon handshake complete");
        Ok(Self {
            channel,
            daemon_pid,
            child: None,
        })
    }

    pub fn daemon_pid(&self) -> i32 {
        self.daemon_pid
    }

    pub fn supports_fd_passing(&self) -> bool {
        self.channel.supports_fd_passing()
    }

    /// Spawn a process tracked as a new app; its pid is the handle.
    pub async fn fork_exec_app(
        &mut self,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<AppId> {
        let resp = self
            .roundtrip(&Request::ForkExecApp { spec, stdio })
            .await?;
        expect_pid(resp, "daemon failed to spawn the app")
    }

    /// Spawn a process tracked as a utility of `app`.
    pub async fn fork_exec_util(
        &mut self,
        app: AppId,
        mode: RunMode,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<UtilStatus> {
        let resp = self
            .roundtrip(&Request::ForkExecUtil {
                app,
                mode,
                spec,
                stdio,
            })
            .await?;
        match (mode, resp) {
            (RunMode::Asynchronous, resp) => {
                expect_pid(resp, "daemon failed to spawn the utility")
                    .map(|pid| UtilStatus::Started { pid })
            }
            (RunMode::Synchronous, Response::Ok { success }) => {
                Ok(UtilStatus::Exited { success })
            }
            (RunMode::Synchronous, other) => Err(unexpected("Ok", &other)),
        }
    }

    /// Launch a job launcher held at its startup barrier.
    pub async fn launch_mpir(
        &mut self,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<MpirData> {
        let resp = self.roundtrip(&Request::LaunchMpir { spec, stdio }).await?;
        expect_mpir(resp, "daemon failed to launch under control")
    }

    /// Attach to a running launcher and hold it stopped.
    pub async fn attach_mpir(&mut self, launcher_pid: i32) -> Result<MpirData> {
        let resp = self.roundtrip(&Request::AttachMpir { launcher_pid }).await?;
        expect_mpir(resp, "daemon failed to attach to the launcher")
    }

    /// Let a held job run. The session dies; the app handle stays valid.
    pub async fn release_mpir(&mut self, session: AppId) -> Result<()> {
        let resp = self.roundtrip(&Request::ReleaseMpir { session }).await?;
        expect_success(resp, "daemon failed to release the barrier")
    }

    /// Drop a control session without releasing the held state.
    pub async fn terminate_mpir(&mut self, session: AppId) -> Result<()> {
        let resp = self.roundtrip(&Request::TerminateMpir { session }).await?;
        expect_success(resp, "daemon failed to terminate the session")
    }

    /// Read the string a `char *` symbol points at in the held launcher.
    pub async fn read_symbol_string(
        &mut self,
        session: AppId,
        symbol: impl Into<String>,
    ) -> Result<String> {
        let resp = self
            .roundtrip(&Request::ReadSymbolString {
                session,
                symbol: symbol.into(),
            })
            .await?;
        match resp {
            Response::String { value: Some(value) } => Ok(value),
            Response::String { value: None } => Err(Error::Operation(OperationError::new(
                "daemon could not read the symbol",
            ))),
            other => Err(unexpected("String", &other)),
        }
    }

    /// Adopt an already-running process as a tracked app.
    pub async fn register_app(&mut self, pid: i32) -> Result<AppId> {
        let resp = self.roundtrip(&Request::RegisterApp { pid }).await?;
        expect_pid(resp, "daemon refused to register the app")
    }

    /// Adopt an already-running process as a utility of `app`.
    pub async fn register_util(&mut self, app: AppId, pid: i32) -> Result<()> {
        let resp = self.roundtrip(&Request::RegisterUtil { app, pid }).await?;
        expect_success(resp, "daemon refused to register the utility")
    }

    /// Terminate the app and all its utilities, then drop tracking.
    pub async fn deregister_app(&mut self, app: AppId) -> Result<()> {
        let resp = self.roundtrip(&Request::DeregisterApp { app }).await?;
        expect_success(resp, "daemon failed to deregister the app")
    }

    /// Whether `app` is still tracked and alive.
    pub async fn check_app(&mut self, app: AppId) -> Result<bool> {
        match self.roundtrip(&Request::CheckApp { app }).await? {
            Response::Ok { success } => Ok(success),
            other => Err(unexpected("Ok", &other)),
        }
    }

    /// Suspend until the app's process exits. `false` for unknown handles.
    pub async fn wait_app(&mut self, app: AppId) -> Result<bool> {
        match self.roundtrip(&Request::WaitApp { app }).await? {
            Response::Ok { success } => Ok(success),
            other => Err(unexpected("Ok", &other)),
        }
    }

    /// Tell the daemon to tear everything down and exit, then reap it.
    pub async fn shutdown(mut self) -> Result<()> {
        let resp = self.roundtrip(&Request::Shutdown).await?;
        expect_success(resp, "daemon refused to shut down")?;
        if let Some(mut child) = self.child.take() {
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn roundtrip(&mut self, req: &Request) -> Result<Response> {
        self.channel.send_request(req).await?;
        self.channel.recv_response().await
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> Error {
    ProtocolError::UnexpectedResponse {
        expected,
        actual: actual.tag(),
    }
    .into()
}

fn expect_pid(resp: Response, on_failure: &str) -> Result<i32> {
    match resp {
        Response::Pid { pid } if pid > 0 => Ok(pid),
        Response::Pid { .. } => Err(Error::Operation(OperationError::new(on_failure))),
        other => Err(unexpected("Pid", &other)),
    }
}

fn expect_success(resp: Response, on_failure: &str) -> Result<()> {
    match resp {
        Response::Ok { success: true } => Ok(()),
        Response::Ok { success: false } => {
            Err(Error::Operation(OperationError::new(on_failure)))
        }
        other => Err(unexpected("Ok", &other)),
    }
}

fn expect_mpir(resp: Response, on_failure: &str) -> Result<MpirData> {
    match resp {
        Response::Mpir(data) => Ok(data),
        // Controller failures come back as a plain failed Ok.
        Response::Ok { success: false } => {
            Err(Error::Operation(OperationError::new(on_failure)))
        }
        other => Err(unexpected("Mpir", &other)),
    }
}
