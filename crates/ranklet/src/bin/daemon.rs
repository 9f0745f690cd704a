//! `ranklet-daemon`: the supervisor process.
//!
//! Spawned by [`DaemonClient::spawn`] with its control socket inherited on
//! the fd named by `RANKLET_CONTROL_FD`. Serves requests until the client
//! shuts it down or disappears; either way the full teardown cascade runs
//! before exit.

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use ranklet::client::CONTROL_FD_ENV;
use ranklet::daemon::Daemon;
use ranklet::bridge::transport::SocketPairTransport;

fn main() -> Result<()> {
    // Stderr only: the control protocol travels on its own fd, stdout stays
    // quiet.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RANKLET_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Mask must be in place before the runtime spawns worker threads, which
    // inherit it. TERM/HUP drive shutdown, CHLD drives child reaping, PIPE
    // must stay default so a dead peer surfaces as EPIPE.
    let mut mask = SigSet::all();
    for keep in [Signal::SIGTERM, Signal::SIGCHLD, Signal::SIGPIPE, Signal::SIGHUP] {
        mask.remove(keep);
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .context("failed to set the signal mask")?;

    let control_fd: i32 = std::env::var(CONTROL_FD_ENV)
        .with_context(|| format!("{CONTROL_FD_ENV} is not set; not spawned by a ranklet client"))?
        .parse()
        .with_context(|| format!("{CONTROL_FD_ENV} does not name a file descriptor"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        // The parent dup'ed the socket onto this fd just for us.
        let transport = unsafe { SocketPairTransport::from_control_fd(control_fd) }
            .context("control fd is not usable as a socket")?;

        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        let shutdown = async move {
            tokio::select! {
                _ = term.recv() => {}
                _ = hup.recv() => {}
            }
        };

        tracing::info!(pid = std::process::id(), "daemon ready");
        Daemon::new(transport)
            .run_until(shutdown)
            .await
            .context("request loop failed")
    })
}
