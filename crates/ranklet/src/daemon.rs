//! The supervisor daemon's request loop.
//!
//! One channel, one client, at most one outstanding request: all tracked
//! state is mutated from this single consumer, with child-exit events
//! funneled into the same loop over an mpsc. Operation failures are logged
//! here and reported inline in the response; only channel loss or protocol
//! corruption ends the loop, and both trigger the full teardown cascade so
//! no supervised process outlives its daemon.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::codec::Channel;
use crate::bridge::protocol::{Request, Response, RunMode};
use crate::bridge::transport::Transport;
use crate::error::{Error, OperationError, Result};
use crate::mpir::MpirController;
use crate::supervisor::{Event, ExitWatch, Supervisor};

/// Liveness poll step while waiting on an adopted (non-child) app.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// A daemon instance bound to its control channel.
pub struct Daemon<T> {
    channel: Channel<T>,
    supervisor: Supervisor,
    mpir: MpirController,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl<T: Transport> Daemon<T> {
    pub fn new(transport: T) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channel: Channel::new(transport),
            mpir: MpirController::new(events_tx.clone()),
            supervisor: Supervisor::new(events_tx),
            events_rx,
        }
    }

    /// Serve requests until the client shuts us down or the channel dies.
    pub async fn run(self) -> Result<()> {
        self.run_until(futures::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), with an external shutdown trigger (the
    /// binary wires TERM/HUP in here).
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            mut channel,
            mut supervisor,
            mut mpir,
            mut events_rx,
        } = self;
        tokio::pin!(shutdown);

        // Startup handshake: the client learns our pid before its first
        // request.
        channel
            .send_response(&Response::Pid {
                pid: std::process::id() as i32,
            })
            .await?;

        let outcome = loop {
            tokio::select! {
                req = channel.recv_request() => match req {
                    Ok(Request::Shutdown) => {
                        tracing::info!("shutdown requested");
                        let _ = channel.send_response(&Response::Ok { success: true }).await;
                        break Ok(());
                    }
                    Ok(req) => {
                        let resp = dispatch(&mut supervisor, &mut mpir, req).await;
                        if let Err(e) = channel.send_response(&resp).await {
                            tracing::info!(error = %e, "control channel lost");
                            break Ok(());
                        }
                    }
                    Err(Error::Transport(e)) => {
                        // Sole client is gone; tear everything down.
                        tracing::info!(error = %e, "control channel lost");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "corrupt request stream");
                        break Err(e);
                    }
                },
                Some(event) = events_rx.recv() => supervisor.handle_event(event),
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break Ok(());
                }
            }
        };

        // Detach held launchers first so the kill cascade can reach them.
        mpir.shutdown().await;
        supervisor.shutdown().await;
        outcome
    }
}

/// Handle one request. Operation failures come back as in-band responses
/// (`Ok{false}` or a negative pid), never as channel errors.
async fn dispatch(supervisor: &mut Supervisor, mpir: &mut MpirController, req: Request) -> Response {
    match req {
        Request::ForkExecApp { spec, stdio } => {
            pid_response("fork/exec app", supervisor.spawn_app(&spec, stdio))
        }

        Request::ForkExecUtil {
            app,
            mode,
            spec,
            stdio,
        } => match supervisor.spawn_util(app, &spec, stdio) {
            Ok((pid, _)) if mode == RunMode::Asynchronous => Response::Pid { pid },
            Ok((_, mut watch)) => {
                // Synchronous: the response is the utility's exit status.
                let clean = watch
                    .wait_for(|v| v.is_some())
                    .await
                    .map(|v| v.unwrap_or(false))
                    .unwrap_or(false);
                Response::Ok { success: clean }
            }
            Err(e) => {
                tracing::warn!(app, error = %e, "fork/exec utility failed");
                match mode {
                    RunMode::Asynchronous => Response::Pid { pid: -1 },
                    RunMode::Synchronous => Response::Ok { success: false },
                }
            }
        },

        Request::LaunchMpir { spec, stdio } => {
            let result = mpir.launch(spec, stdio).await;
            mpir_response(supervisor, mpir, result).await
        }

        Request::AttachMpir { launcher_pid } => {
            let result = mpir.attach(launcher_pid).await;
            mpir_response(supervisor, mpir, result).await
        }

        Request::ReleaseMpir { session } => {
            ok_response("release", mpir.release(session).await)
        }

        Request::TerminateMpir { session } => {
            ok_response("terminate session", mpir.terminate(session).await)
        }

        Request::ReadSymbolString { session, symbol } => match mpir
            .read_string(session, symbol)
            .await
        {
            Ok(value) => Response::String { value: Some(value) },
            Err(e) => {
                tracing::warn!(session, error = %e, "symbol read failed");
                Response::String { value: None }
            }
        },

        Request::RegisterApp { pid } => {
            pid_response("register app", supervisor.adopt_app(pid))
        }

        Request::RegisterUtil { app, pid } => {
            ok_response("register utility", supervisor.adopt_util(app, pid))
        }

        Request::DeregisterApp { app } => {
            // A still-held launcher must be detached before it can be
            // signaled.
            if mpir.is_active(app)
                && let Err(e) = mpir.terminate(app).await
            {
                tracing::warn!(app, error = %e, "failed to detach session before deregister");
            }
            ok_response("deregister", supervisor.deregister(app).await)
        }

        Request::CheckApp { app } => Response::Ok {
            success: supervisor.check(app),
        },

        Request::WaitApp { app } => wait_app(supervisor, app).await,

        // Handled in the run loop; unreachable here, answered anyway.
        Request::Shutdown => Response::Ok { success: true },
    }
}

/// Suspend until the app's process is gone. Unknown handles report failure
/// immediately.
async fn wait_app(supervisor: &mut Supervisor, app: i32) -> Response {
    let Some(proc) = supervisor.proc(app) else {
        return Response::Ok { success: false };
    };

    match proc.exit_watch() {
        Some(mut watch) => {
            let _ = watch.wait_for(|v| v.is_some()).await;
        }
        None => {
            // Adopted process: not our child, poll for disappearance.
            while proc.is_alive() {
                tokio::time::sleep(WAIT_POLL).await;
            }
        }
    }
    Response::Ok { success: true }
}

fn pid_response(what: &str, result: Result<i32, OperationError>) -> Response {
    match result {
        Ok(pid) => Response::Pid { pid },
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed");
            Response::Pid { pid: -1 }
        }
    }
}

fn ok_response(what: &str, result: Result<(), OperationError>) -> Response {
    match result {
        Ok(()) => Response::Ok { success: true },
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed");
            Response::Ok { success: false }
        }
    }
}

async fn mpir_response(
    supervisor: &mut Supervisor,
    mpir: &mut MpirController,
    result: Result<(crate::bridge::protocol::MpirData, Option<ExitWatch>), OperationError>,
) -> Response {
    match result {
        Ok((data, exit)) => {
            // The launcher becomes a tracked app under its session handle so
            // the teardown guarantees cover it. A forked launcher carries its
            // exit watch in; an attached one is someone else's child.
            let tracked = match exit {
                Some(watch) => supervisor.track_child(data.launcher_pid, watch),
                None => supervisor.adopt_app(data.launcher_pid),
            };
            if let Err(e) = tracked {
                tracing::warn!(launcher_pid = data.launcher_pid, error = %e, "cannot track launcher");
                if let Err(e) = mpir.terminate(data.session).await {
                    tracing::warn!(session = data.session, error = %e, "failed to drop session");
                }
                return Response::Ok { success: false };
            }
            Response::Mpir(data)
        }
        Err(e) => {
            tracing::warn!(error = %e, "launcher control failed");
            Response::Ok { success: false }
        }
    }
}
