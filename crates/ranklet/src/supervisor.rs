//! Tracked-process state and the termination cascade.
//!
//! The supervisor owns every process the daemon is responsible for: apps
//! spawned or adopted on behalf of the tool, and the utilities registered
//! under them. All mutation happens on the daemon's single request/event
//! consumer — no internal locking. Waiter tasks and termination tasks only
//! hold pids, watch channels, and the event sender.
//!
//! Lifecycle guarantees:
//! - a utility never outlives its owning app: deregistering an app terminates
//!   its utilities first;
//! - termination is parallel per process (SIGTERM, bounded grace, SIGKILL,
//!   wait), so teardown latency is one grace period, not the sum;
//! - a utility whose process exits on its own is dropped from tracking
//!   automatically, independent of app state.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::bridge::protocol::{AppId, LaunchSpec, StdioSlots};
use crate::error::OperationError;

/// SIGTERM-to-SIGKILL grace period.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// Liveness poll step for processes we did not spawn.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Exit notification: `None` while running, `Some(clean)` once gone.
pub type ExitWatch = watch::Receiver<Option<bool>>;

/// Events funneled back into the daemon's single consumer loop.
#[derive(Debug)]
pub enum Event {
    AppExited(AppId),
    UtilExited { app: AppId, pid: i32 },
}

/// One process under supervision. A daemon-spawned process carries an exit
/// watch fed by its waiter task; an adopted one has only its pid, and
/// liveness falls back to signal 0.
pub struct TrackedProc {
    pid: i32,
    exit: Option<ExitWatch>,
}

impl TrackedProc {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        match &self.exit {
            Some(rx) => rx.borrow().is_none(),
            // An adopted pid is normally someone else's child, but one that
            // is in fact ours would answer signal 0 as a zombie forever;
            // proc_gone reaps it first.
            None => !proc_gone(Pid::from_raw(self.pid)),
        }
    }

    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.exit.clone()
    }

    fn target(&self) -> TermTarget {
        TermTarget {
            pid: self.pid,
            exit: self.exit.clone(),
        }
    }
}

struct AppEntry {
    proc: TrackedProc,
    utils: HashMap<i32, TrackedProc>,
}

/// The daemon's tracked-process table. An app's handle is its main process
/// pid; an MPIR session shares the handle of the launcher it controls.
pub struct Supervisor {
    apps: HashMap<AppId, AppEntry>,
    /// Every handle ever tracked. Removed handles stay here so a deregister
    /// after self-exit is a no-op success, and are never revalidated even if
    /// the kernel reuses the pid.
    issued: HashSet<AppId>,
    events_tx: mpsc::UnboundedSender<Event>,
    /// Cascades triggered by app self-exit; joined at shutdown.
    reapers: JoinSet<()>,
}

impl Supervisor {
    pub fn new(events_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            apps: HashMap::new(),
            issued: HashSet::new(),
            events_tx,
            reapers: JoinSet::new(),
        }
    }

    pub fn tracked_apps(&self) -> usize {
        self.apps.len()
    }

    // ------------------------------------------------------------------ spawn

    /// Fork/exec a process and track it as a new app. The child's pid is the
    /// issued handle.
    pub fn spawn_app(
        &mut self,
        spec: &LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<AppId, OperationError> {
        let proc = self.spawn_tracked(spec, stdio, Event::AppExited)?;
        let id = proc.pid;
        tracing::info!(app = id, exe = %spec.exe, "spawned app");
        self.issued.insert(id);
        self.apps.insert(
            id,
            AppEntry {
                proc,
                utils: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Fork/exec a process tracked as a utility of `app`. Returns the pid and
    /// an exit watch the caller can use for synchronous runs.
    pub fn spawn_util(
        &mut self,
        app: AppId,
        spec: &LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<(i32, ExitWatch), OperationError> {
        if !self.apps.contains_key(&app) {
            return Err(OperationError::new(format!("unknown app handle {app}")));
        }
        let proc = self.spawn_tracked(spec, stdio, move |pid| Event::UtilExited { app, pid })?;
        let pid = proc.pid;
        let watch = proc
            .exit
            .clone()
            .expect("spawned process always has an exit watch");
        tracing::info!(app, pid, exe = %spec.exe, "spawned utility");
        self.apps
            .get_mut(&app)
            .expect("checked above")
            .utils
            .insert(pid, proc);
        Ok((pid, watch))
    }

    fn spawn_tracked(
        &mut self,
        spec: &LaunchSpec,
        stdio: StdioSlots,
        make_event: impl FnOnce(i32) -> Event,
    ) -> Result<TrackedProc, OperationError> {
        let mut cmd = Command::new(&spec.exe);
        if let Some((argv0, rest)) = spec.argv.split_first() {
            cmd.arg0(argv0);
            cmd.args(rest);
        }
        // NAME=VALUE overwrites; NAME= (empty value) removes NAME.
        for entry in &spec.env {
            match entry.split_once('=') {
                Some((name, "")) => {
                    cmd.env_remove(name);
                }
                Some((name, value)) => {
                    cmd.env(name, value);
                }
                None => {
                    return Err(OperationError::new(format!("malformed env entry {entry:?}")));
                }
            }
        }

        let StdioSlots {
            stdin,
            stdout,
            stderr,
        } = stdio;
        cmd.stdin(stdin.map_or_else(Stdio::null, Stdio::from));
        cmd.stdout(stdout.map_or_else(Stdio::null, Stdio::from));
        cmd.stderr(stderr.map_or_else(Stdio::null, Stdio::from));

        let mut child = cmd
            .spawn()
            .map_err(|e| OperationError::new(format!("failed to spawn {}: {e}", spec.exe)))?;
        let pid = child
            .id()
            .ok_or_else(|| OperationError::new("spawned process exited before tracking"))?
            as i32;

        let (exit_tx, exit_rx) = watch::channel(None);
        let events = self.events_tx.clone();
        let event = make_event(pid);
        tokio::spawn(async move {
            let clean = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "wait on child failed");
                    false
                }
            };
            tracing::debug!(pid, clean, "tracked process exited");
            let _ = exit_tx.send(Some(clean));
            let _ = events.send(event);
        });

        Ok(TrackedProc {
            pid,
            exit: Some(exit_rx),
        })
    }

    // ------------------------------------------------------------------ adopt

    /// Adopt an already-forked process as a tracked app under its own pid.
    pub fn adopt_app(&mut self, pid: i32) -> Result<AppId, OperationError> {
        if pid <= 0 {
            return Err(OperationError::new(format!("invalid app pid {pid}")));
        }
        if self.apps.contains_key(&pid) {
            return Err(OperationError::new(format!(
                "pid {pid} is already tracked as an app"
            )));
        }
        tracing::info!(app = pid, "registered app");
        self.issued.insert(pid);
        self.apps.insert(
            pid,
            AppEntry {
                proc: TrackedProc { pid, exit: None },
                utils: HashMap::new(),
            },
        );
        Ok(pid)
    }

    /// Track a process that is our child but was not spawned through the
    /// supervisor (a launched MPIR launcher). The caller supplies the exit
    /// watch; whoever feeds it is responsible for reaping the pid.
    pub fn track_child(&mut self, pid: i32, exit: ExitWatch) -> Result<AppId, OperationError> {
        if pid <= 0 {
            return Err(OperationError::new(format!("invalid app pid {pid}")));
        }
        if self.apps.contains_key(&pid) {
            return Err(OperationError::new(format!(
                "pid {pid} is already tracked as an app"
            )));
        }
        tracing::info!(app = pid, "tracking child process");
        self.issued.insert(pid);
        self.apps.insert(
            pid,
            AppEntry {
                proc: TrackedProc {
                    pid,
                    exit: Some(exit),
                },
                utils: HashMap::new(),
            },
        );
        Ok(pid)
    }

    pub fn adopt_util(&mut self, app: AppId, pid: i32) -> Result<(), OperationError> {
        if pid <= 0 {
            return Err(OperationError::new(format!("invalid utility pid {pid}")));
        }
        let entry = self
            .apps
            .get_mut(&app)
            .ok_or_else(|| OperationError::new(format!("unknown app handle {app}")))?;
        tracing::info!(app, pid, "registered utility");
        entry.utils.insert(
            pid,
            TrackedProc { pid, exit: None },
        );
        Ok(())
    }

    // ------------------------------------------------------------------ query

    pub fn check(&self, app: AppId) -> bool {
        self.apps
            .get(&app)
            .is_some_and(|entry| entry.proc.is_alive())
    }

    pub fn proc(&self, app: AppId) -> Option<&TrackedProc> {
        self.apps.get(&app).map(|entry| &entry.proc)
    }

    // ---------------------------------------------------------------- teardown

    /// Terminate all utilities of `app` in parallel, then the app itself,
    /// then drop tracking. Unknown-but-once-issued handles are a no-op.
    pub async fn deregister(&mut self, app: AppId) -> Result<(), OperationError> {
        let Some(entry) = self.apps.remove(&app) else {
            if self.issued.contains(&app) {
                tracing::debug!(app, "deregister of already-removed app");
                return Ok(());
            }
            return Err(OperationError::new(format!("unknown app handle {app}")));
        };

        tracing::info!(app, pid = entry.proc.pid, utils = entry.utils.len(), "deregistering app");
        let mut cascade = JoinSet::new();
        for util in entry.utils.into_values() {
            cascade.spawn(terminate(util.target()));
        }
        cascade.spawn(terminate(entry.proc.target()));
        while cascade.join_next().await.is_some() {}
        Ok(())
    }

    /// Deregister every tracked app. The daemon exits after this.
    pub async fn shutdown(&mut self) {
        let ids: Vec<AppId> = self.apps.keys().copied().collect();
        tracing::info!(apps = ids.len(), "supervisor shutdown");

        let mut cascade = JoinSet::new();
        for id in ids {
            if let Some(entry) = self.apps.remove(&id) {
                for util in entry.utils.into_values() {
                    cascade.spawn(terminate(util.target()));
                }
                cascade.spawn(terminate(entry.proc.target()));
            }
        }
        while cascade.join_next().await.is_some() {}

        // Cascades started by self-exit events.
        while self.reapers.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------ events

    /// Funneled child-exit handling; still single-writer (called only from
    /// the daemon's consumer loop).
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::AppExited(app) => {
                if let Some(entry) = self.apps.remove(&app) {
                    tracing::debug!(app, pid = entry.proc.pid, "app exited on its own");
                    if !entry.utils.is_empty() {
                        let utils: Vec<TermTarget> =
                            entry.utils.values().map(TrackedProc::target).collect();
                        self.reapers.spawn(async move {
                            let mut cascade = JoinSet::new();
                            for util in utils {
                                cascade.spawn(terminate(util));
                            }
                            while cascade.join_next().await.is_some() {}
                        });
                    }
                }
            }
            Event::UtilExited { app, pid } => {
                if let Some(entry) = self.apps.get_mut(&app) {
                    entry.utils.remove(&pid);
                    tracing::debug!(app, pid, "utility exited on its own");
                }
            }
        }
    }
}

/// What a termination task needs: no access to the tracked map.
struct TermTarget {
    pid: i32,
    exit: Option<ExitWatch>,
}

/// SIGTERM → bounded grace → SIGKILL → wait. Idempotent on already-dead
/// processes.
async fn terminate(mut target: TermTarget) {
    let pid = Pid::from_raw(target.pid);

    if let Some(rx) = &target.exit
        && rx.borrow().is_some()
    {
        return;
    }

    tracing::debug!(pid = target.pid, "terminating");
    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Already gone (or not ours to signal); make sure no zombie remains.
        reap(pid);
        return;
    }

    if !await_exit(pid, &mut target.exit, TERM_GRACE).await {
        tracing::warn!(pid = target.pid, "grace period expired, sending SIGKILL");
        let _ = signal::kill(pid, Signal::SIGKILL);
        await_exit(pid, &mut target.exit, TERM_GRACE).await;
    }
    reap(pid);
}

/// True once the process is observed gone within `bound`.
async fn await_exit(pid: Pid, exit: &mut Option<ExitWatch>, bound: Duration) -> bool {
    match exit {
        Some(rx) => tokio::time::timeout(bound, rx.wait_for(|v| v.is_some()))
            .await
            .is_ok(),
        None => {
            let deadline = tokio::time::Instant::now() + bound;
            loop {
                if proc_gone(pid) {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(POLL_STEP).await;
            }
        }
    }
}

/// Collect an exit status if the process is our child; tolerate everything
/// else (adopted processes are someone else's children).
fn reap(pid: Pid) {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

/// Process-gone check that sees through our own zombies: a zombie child still
/// answers signal 0, so try to reap first.
fn proc_gone(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => true,
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => false,
        Err(Errno::ECHILD) => signal::kill(pid, None).is_err(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_spec(secs: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sleep").args(["sleep", secs])
    }

    fn supervisor() -> (Supervisor, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(tx), rx)
    }

    #[tokio::test]
    async fn spawned_app_is_alive_then_deregistered() {
        let (mut sup, _rx) = supervisor();

        let id = sup.spawn_app(&sleep_spec("30"), StdioSlots::none()).unwrap();
        assert!(id > 0);
        assert!(sup.check(id));

        sup.deregister(id).await.unwrap();
        assert!(!sup.check(id));

        // Idempotent: once-issued handle, no longer tracked.
        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_handle_is_operation_error() {
        let (mut sup, _rx) = supervisor();
        assert!(sup.deregister(42).await.is_err());
        assert!(sup.adopt_util(42, 1234).is_err());
        assert!(!sup.check(42));
    }

    #[tokio::test]
    async fn deregister_terminates_all_utilities() {
        let (mut sup, _rx) = supervisor();

        let id = sup.spawn_app(&sleep_spec("30"), StdioSlots::none()).unwrap();
        let mut util_pids = Vec::new();
        for _ in 0..3 {
            let (pid, _watch) = sup
                .spawn_util(id, &sleep_spec("30"), StdioSlots::none())
                .unwrap();
            util_pids.push(pid);
        }

        sup.deregister(id).await.unwrap();
        for pid in util_pids {
            assert!(
                signal::kill(Pid::from_raw(pid), None).is_err(),
                "utility {pid} still alive"
            );
        }
    }

    #[tokio::test]
    async fn self_exit_event_drops_tracking() {
        let (mut sup, mut rx) = supervisor();

        let id = sup
            .spawn_app(
                &LaunchSpec::new("/bin/true").args(["true"]),
                StdioSlots::none(),
            )
            .unwrap();

        let event = rx.recv().await.expect("exit event");
        sup.handle_event(event);
        assert!(!sup.check(id));

        // Deregister after self-exit is a no-op success.
        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn sync_util_watch_reports_exit_status() {
        let (mut sup, _rx) = supervisor();

        let id = sup.spawn_app(&sleep_spec("30"), StdioSlots::none()).unwrap();
        let (_pid, mut watch) = sup
            .spawn_util(id, &LaunchSpec::new("/bin/false").args(["false"]), StdioSlots::none())
            .unwrap();

        let status = watch.wait_for(|v| v.is_some()).await.unwrap();
        assert_eq!(*status, Some(false));

        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn adopted_app_is_handled_by_its_pid() {
        let (mut sup, _rx) = supervisor();

        // Adopt the test process itself: alive, and not our child.
        let me = std::process::id() as i32;
        let id = sup.adopt_app(me).unwrap();
        assert_eq!(id, me);
        assert!(sup.check(id));

        // A pid can back at most one tracked app.
        assert!(sup.adopt_app(me).is_err());
        assert!(sup.adopt_app(0).is_err());

        // Drop tracking without the kill cascade reaching us.
        sup.handle_event(Event::AppExited(id));
        assert!(!sup.check(id));
        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn adopted_own_child_is_reported_gone_once_it_exits() {
        let (mut sup, _rx) = supervisor();

        // Adopt a pid that is secretly our own child: after it dies its
        // zombie must not keep the liveness check true.
        let child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        std::mem::forget(child);

        let id = sup.adopt_app(pid).unwrap();
        assert!(sup.check(id));

        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sup.check(id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "exited child still reported alive"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn tracked_child_exit_is_observed_despite_the_zombie() {
        // A child we forked outside the supervisor (the launched-launcher
        // case): signal 0 would keep answering true on the zombie, so the
        // exit must come through the watch and the event stream.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(tx.clone());

        let child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        std::mem::forget(child);

        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::spawn(move || {
            let clean = matches!(
                waitpid(Pid::from_raw(pid), None),
                Ok(WaitStatus::Exited(_, 0))
            );
            let _ = exit_tx.send(Some(clean));
            let _ = tx.send(Event::AppExited(pid));
        });

        let id = sup.track_child(pid, exit_rx).unwrap();
        assert_eq!(id, pid);
        assert!(sup.check(id));

        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        let event = rx.recv().await.expect("exit event");
        sup.handle_event(event);
        assert!(!sup.check(id));
        sup.deregister(id).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let (mut sup, _rx) = supervisor();

        let a = sup.spawn_app(&sleep_spec("30"), StdioSlots::none()).unwrap();
        let b = sup.spawn_app(&sleep_spec("30"), StdioSlots::none()).unwrap();
        sup.spawn_util(a, &sleep_spec("30"), StdioSlots::none()).unwrap();

        sup.shutdown().await;
        assert_eq!(sup.tracked_apps(), 0);
        assert!(signal::kill(Pid::from_raw(a), None).is_err());
        assert!(signal::kill(Pid::from_raw(b), None).is_err());
    }
}
