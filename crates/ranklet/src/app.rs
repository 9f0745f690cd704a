//! Client-side application objects layered over daemon handles.
//!
//! An [`App`] wraps a supervisor handle plus the metadata the daemon
//! reported at creation (job/step ids, rank placement) and enforces the
//! lifecycle state machine locally, so illegal transitions fail before a
//! request is ever written.

use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::Mutex;

use crate::bridge::protocol::{AppId, LaunchSpec, MpirData, ProcTableEntry, RunMode, StdioSlots};
use crate::bridge::transport::Transport;
use crate::client::{DaemonClient, UtilStatus};
use crate::error::{Error, OperationError, Result};
use crate::wlm::WlmConfig;

/// Lifecycle of a tracked application, client-side view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Created but not yet observed held or running.
    Constructed,
    /// Held at the MPIR startup barrier; no rank has run.
    AtBarrier,
    Running,
    /// Terminal. The handle is dead and never revalidated.
    Deregistered,
}

/// Lifecycle operations common to every application kind.
#[async_trait]
pub trait App: Send {
    /// Workload-manager job identifier, formatted per the configured WLM.
    fn job_id(&self) -> String;

    fn num_ranks(&self) -> usize;

    /// Ordered `(hostname, rank-count)` pairs, first-appearance order.
    fn placement(&self) -> Vec<(String, usize)>;

    fn state(&self) -> AppState;

    /// Let a barrier-held job run. Only valid in [`AppState::AtBarrier`].
    async fn release_barrier(&mut self) -> Result<()>;

    /// Signal the application's main process. Valid while held or running.
    ///
    /// The signal is sent directly from the calling process, so the handle
    /// pid must be visible here: this requires the daemon to run on the same
    /// host (and pid namespace) as the tool. Over a relayed transport to a
    /// remote daemon, signal through the workload manager instead.
    async fn kill(&mut self, signal: Signal) -> Result<()>;

    /// Launch `argv` as a supervised utility of this app; returns its pid.
    async fn start_utility(&mut self, argv: Vec<String>) -> Result<i32>;

    /// Terminate the app and every utility, then drop tracking.
    async fn deregister(&mut self) -> Result<()>;
}

/// Fold a process table into `(hostname, rank-count)` pairs, preserving the
/// order in which each host first appears.
pub fn fold_placement(proctable: &[ProcTableEntry]) -> Vec<(String, usize)> {
    let mut folded: Vec<(String, usize)> = Vec::new();
    for entry in proctable {
        match folded.iter_mut().find(|(host, _)| *host == entry.hostname) {
            Some((_, count)) => *count += 1,
            None => folded.push((entry.hostname.clone(), 1)),
        }
    }
    folded
}

fn wrong_state(op: &str, state: AppState) -> Error {
    Error::Operation(OperationError::new(format!(
        "cannot {op} an app in state {state:?}"
    )))
}

/// Shared plumbing: the daemon connection, the handle, and the state gate.
struct AppBase<T: Transport + 'static> {
    client: Arc<Mutex<DaemonClient<T>>>,
    handle: AppId,
    state: AppState,
}

impl<T: Transport + 'static> AppBase<T> {
    fn ensure(&self, op: &str, allowed: &[AppState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(wrong_state(op, self.state))
        }
    }

    async fn kill(&mut self, signal: Signal) -> Result<()> {
        self.ensure("signal", &[AppState::AtBarrier, AppState::Running])?;
        signal::kill(Pid::from_raw(self.handle), signal).map_err(|e| {
            Error::Operation(OperationError::new(format!(
                "failed to signal pid {}: {e}",
                self.handle
            )))
        })
    }

    async fn start_utility(&mut self, argv: Vec<String>) -> Result<i32> {
        self.ensure("start a utility under", &[AppState::Running])?;
        let exe = argv
            .first()
            .cloned()
            .ok_or_else(|| Error::Operation(OperationError::new("empty utility argv")))?;
        let spec = LaunchSpec::new(exe).args(argv);
        let status = self
            .client
            .lock()
            .await
            .fork_exec_util(self.handle, RunMode::Asynchronous, spec, StdioSlots::none())
            .await?;
        match status {
            UtilStatus::Started { pid } => Ok(pid),
            UtilStatus::Exited { .. } => Err(Error::Operation(OperationError::new(
                "asynchronous utility reported an exit status",
            ))),
        }
    }

    async fn deregister(&mut self) -> Result<()> {
        if self.state == AppState::Deregistered {
            return Ok(());
        }
        self.client
            .lock()
            .await
            .deregister_app(self.handle)
            .await?;
        self.state = AppState::Deregistered;
        Ok(())
    }
}

impl<T: Transport + 'static> Drop for AppBase<T> {
    fn drop(&mut self) {
        if self.state == AppState::Deregistered {
            return;
        }
        // Best effort: a handle the daemon already dropped deregisters as a
        // no-op success.
        let client = self.client.clone();
        let handle = self.handle;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = client.lock().await.deregister_app(handle).await {
                    tracing::debug!(app = handle, error = %e, "cleanup deregister failed");
                }
            });
        }
    }
}

/// An application created through MPIR launch or attach: rich placement
/// data, and a barrier to release exactly once.
pub struct MpirApp<T: Transport + 'static> {
    base: AppBase<T>,
    data: MpirData,
    wlm: WlmConfig,
}

impl<T: Transport + 'static> MpirApp<T> {
    /// Launch a job launcher under control; the app starts at the barrier.
    pub async fn launch(
        client: Arc<Mutex<DaemonClient<T>>>,
        wlm: WlmConfig,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<Self> {
        wlm.ensure_supported()?;
        let data = client.lock().await.launch_mpir(spec, stdio).await?;
        Ok(Self::held(client, wlm, data))
    }

    /// Attach to a running launcher; the app starts at the barrier (held by
    /// the attach stop, even if its ranks were already running).
    pub async fn attach(
        client: Arc<Mutex<DaemonClient<T>>>,
        wlm: WlmConfig,
        launcher_pid: i32,
    ) -> Result<Self> {
        wlm.ensure_supported()?;
        let data = client.lock().await.attach_mpir(launcher_pid).await?;
        Ok(Self::held(client, wlm, data))
    }

    fn held(client: Arc<Mutex<DaemonClient<T>>>, wlm: WlmConfig, data: MpirData) -> Self {
        Self {
            base: AppBase {
                client,
                handle: data.session,
                state: AppState::AtBarrier,
            },
            data,
            wlm,
        }
    }

    pub fn launcher_pid(&self) -> i32 {
        self.data.launcher_pid
    }

    /// Read a string symbol from the held launcher. Only meaningful while
    /// the session is alive, i.e. before the barrier is released.
    pub async fn read_symbol_string(&mut self, symbol: impl Into<String>) -> Result<String> {
        self.base.ensure("read launcher memory of", &[AppState::AtBarrier])?;
        self.base
            .client
            .lock()
            .await
            .read_symbol_string(self.base.handle, symbol)
            .await
    }
}

#[async_trait]
impl<T: Transport + 'static> App for MpirApp<T> {
    fn job_id(&self) -> String {
        self.wlm.format_job_id(self.data.job_id, self.data.step_id)
    }

    fn num_ranks(&self) -> usize {
        self.data.proctable.len()
    }

    fn placement(&self) -> Vec<(String, usize)> {
        fold_placement(&self.data.proctable)
    }

    fn state(&self) -> AppState {
        self.base.state
    }

    async fn release_barrier(&mut self) -> Result<()> {
        self.base.ensure("release", &[AppState::AtBarrier])?;
        self.base
            .client
            .lock()
            .await
            .release_mpir(self.base.handle)
            .await?;
        self.base.state = AppState::Running;
        Ok(())
    }

    async fn kill(&mut self, signal: Signal) -> Result<()> {
        self.base.kill(signal).await
    }

    async fn start_utility(&mut self, argv: Vec<String>) -> Result<i32> {
        self.base.start_utility(argv).await
    }

    async fn deregister(&mut self) -> Result<()> {
        self.base.deregister().await
    }
}

/// An application the daemon fork/exec'ed (or adopted) without MPIR: a
/// single local process, no barrier.
pub struct ForkedApp<T: Transport + 'static> {
    base: AppBase<T>,
    hostname: String,
}

impl<T: Transport + 'static> ForkedApp<T> {
    /// Spawn `spec` as a supervised app.
    pub async fn spawn(
        client: Arc<Mutex<DaemonClient<T>>>,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<Self> {
        let handle = client.lock().await.fork_exec_app(spec, stdio).await?;
        Ok(Self::running(client, handle))
    }

    /// Adopt a process the caller already forked.
    pub async fn register(
        client: Arc<Mutex<DaemonClient<T>>>,
        pid: i32,
    ) -> Result<Self> {
        let handle = client.lock().await.register_app(pid).await?;
        Ok(Self::running(client, handle))
    }

    fn running(client: Arc<Mutex<DaemonClient<T>>>, handle: AppId) -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            base: AppBase {
                client,
                handle,
                state: AppState::Running,
            },
            hostname,
        }
    }

    pub fn pid(&self) -> i32 {
        self.base.handle
    }
}

#[async_trait]
impl<T: Transport + 'static> App for ForkedApp<T> {
    fn job_id(&self) -> String {
        self.base.handle.to_string()
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn placement(&self) -> Vec<(String, usize)> {
        vec![(self.hostname.clone(), 1)]
    }

    fn state(&self) -> AppState {
        self.base.state
    }

    async fn release_barrier(&mut self) -> Result<()> {
        Err(wrong_state("release", self.base.state))
    }

    async fn kill(&mut self, signal: Signal) -> Result<()> {
        self.base.kill(signal).await
    }

    async fn start_utility(&mut self, argv: Vec<String>) -> Result<i32> {
        self.base.start_utility(argv).await
    }

    async fn deregister(&mut self) -> Result<()> {
        self.base.deregister().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32, host: &str) -> ProcTableEntry {
        ProcTableEntry {
            pid,
            hostname: host.to_string(),
        }
    }

    #[test]
    fn placement_folds_in_first_appearance_order() {
        let table = vec![
            entry(100, "nid000002"),
            entry(101, "nid000001"),
            entry(102, "nid000002"),
            entry(103, "nid000003"),
            entry(104, "nid000002"),
        ];
        assert_eq!(
            fold_placement(&table),
            vec![
                ("nid000002".to_string(), 3),
                ("nid000001".to_string(), 1),
                ("nid000003".to_string(), 1),
            ]
        );
    }

    #[test]
    fn placement_of_empty_table_is_empty() {
        assert!(fold_placement(&[]).is_empty());
    }
}
