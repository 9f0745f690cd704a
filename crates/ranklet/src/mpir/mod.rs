//! Launcher control sessions.
//!
//! Each held launcher gets a dedicated OS thread that owns its ptrace
//! attachment; all requests against the trace must come from that thread.
//! The controller bridges the async daemon loop to those threads with a
//! std channel inbound and a oneshot per reply outbound. Sessions are keyed
//! by launcher pid, which doubles as the session's app handle.

pub mod inferior;
pub mod instance;

use std::collections::HashMap;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::protocol::{AppId, LaunchSpec, MpirData, ProcTableEntry, StdioSlots};
use crate::error::OperationError;
use crate::mpir::instance::MpirInstance;
use crate::supervisor::{Event, ExitWatch};

enum SessionCmd {
    ReadString {
        symbol: String,
        reply: oneshot::Sender<Result<String, OperationError>>,
    },
    /// Clear the debug flag and detach; the job starts.
    Release {
        reply: oneshot::Sender<Result<(), OperationError>>,
    },
    /// Detach without clearing the debug flag; caller decides the launcher's
    /// fate through its app handle.
    Terminate {
        reply: oneshot::Sender<Result<(), OperationError>>,
    },
}

struct Session {
    cmd_tx: std::sync::mpsc::Sender<SessionCmd>,
}

struct BarrierInfo {
    launcher_pid: i32,
    job_id: u32,
    step_id: u32,
    proctable: Vec<ProcTableEntry>,
    /// Exit notification for a launcher we forked; `None` for attached
    /// launchers, whose exits belong to their real parent.
    exit: Option<ExitWatch>,
}

/// Owns every live launcher-control session in the daemon. At most one
/// session per launcher pid.
pub struct MpirController {
    sessions: HashMap<AppId, Session>,
    /// Feeds launcher self-exits into the daemon's consumer loop, exactly
    /// like the supervisor's own waiter tasks.
    events_tx: mpsc::UnboundedSender<Event>,
}

impl MpirController {
    pub fn new(events_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            sessions: HashMap::new(),
            events_tx,
        }
    }

    pub fn is_active(&self, session: AppId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Launch `spec` under control and hold it at its startup barrier. The
    /// returned watch reports the launcher's eventual exit.
    pub async fn launch(
        &mut self,
        spec: LaunchSpec,
        stdio: StdioSlots,
    ) -> Result<(MpirData, Option<ExitWatch>), OperationError> {
        self.start(move || MpirInstance::launch(&spec, stdio)).await
    }

    /// Attach to a running launcher and hold it stopped.
    pub async fn attach(
        &mut self,
        launcher_pid: i32,
    ) -> Result<(MpirData, Option<ExitWatch>), OperationError> {
        if self.sessions.contains_key(&launcher_pid) {
            return Err(OperationError::new(format!(
                "launcher {launcher_pid} is already under control"
            )));
        }
        self.start(move || MpirInstance::attach(launcher_pid)).await
    }

    async fn start<F>(&mut self, acquire: F) -> Result<(MpirData, Option<ExitWatch>), OperationError>
    where
        F: FnOnce() -> Result<MpirInstance, OperationError> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let events_tx = self.events_tx.clone();
        std::thread::Builder::new()
            .name("mpir-session".into())
            .spawn(move || session_thread(acquire, events_tx, ready_tx, cmd_rx))
            .map_err(|e| OperationError::new(format!("cannot start session thread: {e}")))?;

        let BarrierInfo {
            launcher_pid,
            job_id,
            step_id,
            proctable,
            exit,
        } = ready_rx
            .await
            .map_err(|_| OperationError::new("session thread died during startup"))??;

        if self.sessions.contains_key(&launcher_pid) {
            // Cannot happen for attach (checked above) and a fresh launch has
            // a fresh pid; refuse rather than clobber the live session.
            drop(cmd_tx);
            return Err(OperationError::new(format!(
                "launcher {launcher_pid} is already under control"
            )));
        }

        self.sessions.insert(launcher_pid, Session { cmd_tx });
        tracing::info!(
            session = launcher_pid,
            ranks = proctable.len(),
            "launcher held under control"
        );

        Ok((
            MpirData {
                session: launcher_pid,
                launcher_pid,
                job_id,
                step_id,
                proctable,
            },
            exit,
        ))
    }

    pub async fn read_string(
        &mut self,
        session: AppId,
        symbol: String,
    ) -> Result<String, OperationError> {
        let entry = self
            .sessions
            .get(&session)
            .ok_or_else(|| unknown_session(session))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        entry
            .cmd_tx
            .send(SessionCmd::ReadString {
                symbol,
                reply: reply_tx,
            })
            .map_err(|_| session_gone(session))?;
        reply_rx.await.map_err(|_| session_gone(session))?
    }

    /// Release the barrier and drop the session. The launcher runs free but
    /// stays tracked under its app handle.
    pub async fn release(&mut self, session: AppId) -> Result<(), OperationError> {
        self.finish(session, |reply| SessionCmd::Release { reply })
            .await
    }

    /// Drop the session without releasing the held state.
    pub async fn terminate(&mut self, session: AppId) -> Result<(), OperationError> {
        self.finish(session, |reply| SessionCmd::Terminate { reply })
            .await
    }

    async fn finish<F>(&mut self, session: AppId, make: F) -> Result<(), OperationError>
    where
        F: FnOnce(oneshot::Sender<Result<(), OperationError>>) -> SessionCmd,
    {
        let entry = self
            .sessions
            .remove(&session)
            .ok_or_else(|| unknown_session(session))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        entry
            .cmd_tx
            .send(make(reply_tx))
            .map_err(|_| session_gone(session))?;
        reply_rx.await.map_err(|_| session_gone(session))?
    }

    /// Detach every session; run before the shutdown kill cascade so the
    /// launchers are signalable again.
    pub async fn shutdown(&mut self) {
        let ids: Vec<AppId> = self.sessions.keys().copied().collect();
        for session in ids {
            if let Err(e) = self.terminate(session).await {
                tracing::warn!(session, error = %e, "failed to detach session at shutdown");
            }
        }
    }
}

fn unknown_session(session: AppId) -> OperationError {
    OperationError::new(format!("no such session {session}"))
}

fn session_gone(session: AppId) -> OperationError {
    OperationError::new(format!("session {session} thread is gone"))
}

fn session_thread<F>(
    acquire: F,
    events_tx: mpsc::UnboundedSender<Event>,
    ready_tx: oneshot::Sender<Result<BarrierInfo, OperationError>>,
    cmd_rx: std::sync::mpsc::Receiver<SessionCmd>,
) where
    F: FnOnce() -> Result<MpirInstance, OperationError>,
{
    let instance = match acquire() {
        Ok(instance) => instance,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let pid = instance.launcher_pid();
    let spawned = instance.is_spawned_child();
    let (exit_tx, exit_rx) = watch::channel(None);

    let (job_id, step_id) = instance.job_step_ids();
    let info = instance.proctable().map(|proctable| BarrierInfo {
        launcher_pid: pid,
        job_id,
        step_id,
        proctable,
        exit: spawned.then_some(exit_rx),
    });
    let failed = info.is_err();
    if ready_tx.send(info).is_err() || failed {
        // Nobody is listening, or the barrier state was unreadable; the
        // launcher never reaches the tracked set, so a forked one must not
        // be left running or unreaped.
        let _ = instance.terminate();
        if spawned {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            collect_exit(pid);
        }
        return;
    }

    serve(instance, cmd_rx);

    // A forked launcher stays our child after detach; stay around to reap it
    // and report the exit, however long the job runs.
    if spawned {
        let clean = collect_exit(pid);
        tracing::debug!(pid, clean, "launcher exited");
        let _ = exit_tx.send(Some(clean));
        let _ = events_tx.send(Event::AppExited(pid));
    }
}

fn serve(instance: MpirInstance, cmd_rx: std::sync::mpsc::Receiver<SessionCmd>) {
    loop {
        match cmd_rx.recv() {
            Ok(SessionCmd::ReadString { symbol, reply }) => {
                let _ = reply.send(instance.read_string_symbol(&symbol));
            }
            Ok(SessionCmd::Release { reply }) => {
                let _ = reply.send(instance.release());
                return;
            }
            Ok(SessionCmd::Terminate { reply }) => {
                let _ = reply.send(instance.terminate());
                return;
            }
            Err(_) => {
                // Controller dropped the sender without a final command;
                // detach so the launcher is not left permanently stopped.
                let _ = instance.terminate();
                return;
            }
        }
    }
}

/// Blocking wait for a launcher we forked. True on a clean exit.
fn collect_exit(pid: i32) -> bool {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => return code == 0,
            Ok(WaitStatus::Signaled(..)) => return false,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(pid, error = %e, "wait on launcher failed");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forget_spawn(exe: &str) -> i32 {
        let child = std::process::Command::new(exe).spawn().unwrap();
        let pid = child.id() as i32;
        // The exit is collected through waitpid, not the Child handle.
        std::mem::forget(child);
        pid
    }

    #[test]
    fn collecting_a_forgotten_child_reports_its_exit() {
        assert!(collect_exit(forget_spawn("/bin/true")));
        assert!(!collect_exit(forget_spawn("/bin/false")));
    }
}
