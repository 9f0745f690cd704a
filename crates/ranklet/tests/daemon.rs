//! End-to-end exercises of the daemon request loop, run in-process over a
//! duplex byte stream (the relayed-transport path, so no fd passing).

use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use ranklet::app::App;
use ranklet::bridge::transport::RelayedTransport;
use ranklet::client::{DaemonClient, UtilStatus};
use ranklet::daemon::Daemon;
use ranklet::error::Error;
use ranklet::{ForkedApp, LaunchSpec, Result, RunMode, StdioSlots};

type TestTransport = RelayedTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

async fn start_daemon() -> (DaemonClient<TestTransport>, JoinHandle<Result<()>>) {
    let (client_io, daemon_io) = duplex(1 << 16);
    let (cr, cw) = split(client_io);
    let (dr, dw) = split(daemon_io);

    let task = tokio::spawn(Daemon::new(RelayedTransport::new(dr, dw)).run());
    let client = DaemonClient::over(RelayedTransport::new(cr, cw))
        .await
        .expect("handshake");
    (client, task)
}

fn sleep_spec(secs: &str) -> LaunchSpec {
    LaunchSpec::new("/bin/sleep").args(["sleep", secs])
}

fn alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[tokio::test]
async fn handshake_reports_the_daemon_pid() {
    let (client, _task) = start_daemon().await;
    // In-process daemon: its pid is ours.
    assert_eq!(client.daemon_pid(), std::process::id() as i32);
}

#[tokio::test]
async fn app_lifecycle_check_deregister() {
    let (mut client, _task) = start_daemon().await;

    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();
    assert!(app > 0);
    assert!(client.check_app(app).await.unwrap());

    client.deregister_app(app).await.unwrap();
    assert!(!client.check_app(app).await.unwrap());
    assert!(!alive(app));

    // Deregistering a handle the daemon already dropped is a no-op success.
    client.deregister_app(app).await.unwrap();
}

#[tokio::test]
async fn wait_returns_once_the_app_exits() {
    let (mut client, _task) = start_daemon().await;

    let app = client
        .fork_exec_app(
            LaunchSpec::new("/bin/sleep").args(["sleep", "0.2"]),
            StdioSlots::none(),
        )
        .await
        .unwrap();

    let waited = timeout(Duration::from_secs(5), client.wait_app(app))
        .await
        .expect("wait must not hang")
        .unwrap();
    assert!(waited);
}

#[tokio::test]
async fn unknown_handles_fail_without_killing_the_daemon() {
    let (mut client, _task) = start_daemon().await;

    assert!(!client.check_app(999_999).await.unwrap());
    assert!(!client.wait_app(999_999).await.unwrap());
    assert!(matches!(
        client.deregister_app(999_999).await.unwrap_err(),
        Error::Operation(_)
    ));

    // The daemon is still serving.
    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();
    client.deregister_app(app).await.unwrap();
}

#[tokio::test]
async fn deregister_cascades_to_utilities() {
    let (mut client, _task) = start_daemon().await;

    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();

    let mut utils = Vec::new();
    for _ in 0..2 {
        match client
            .fork_exec_util(app, RunMode::Asynchronous, sleep_spec("30"), StdioSlots::none())
            .await
            .unwrap()
        {
            UtilStatus::Started { pid } => utils.push(pid),
            other => panic!("unexpected status {other:?}"),
        }
    }

    client.deregister_app(app).await.unwrap();
    assert!(!alive(app));
    for pid in utils {
        assert!(!alive(pid), "utility {pid} survived the cascade");
    }
}

#[tokio::test]
async fn synchronous_utility_reports_its_exit_status() {
    let (mut client, _task) = start_daemon().await;

    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();

    let failed = client
        .fork_exec_util(
            app,
            RunMode::Synchronous,
            LaunchSpec::new("/bin/false").args(["false"]),
            StdioSlots::none(),
        )
        .await
        .unwrap();
    assert_eq!(failed, UtilStatus::Exited { success: false });

    let ok = client
        .fork_exec_util(
            app,
            RunMode::Synchronous,
            LaunchSpec::new("/bin/true").args(["true"]),
            StdioSlots::none(),
        )
        .await
        .unwrap();
    assert_eq!(ok, UtilStatus::Exited { success: true });

    client.deregister_app(app).await.unwrap();
}

#[tokio::test]
async fn registered_process_is_supervised() {
    let (mut client, _task) = start_daemon().await;

    let mut child = tokio::process::Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;

    let app = client.register_app(pid).await.unwrap();
    assert_eq!(app, pid);
    assert!(client.check_app(app).await.unwrap());

    // Registering the same pid twice is refused.
    assert!(client.register_app(pid).await.is_err());

    client.deregister_app(app).await.unwrap();
    // The in-process daemon's cascade may already have reaped the child, so
    // wait() can report ECHILD; the pid being gone is the real assertion.
    let waited = timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("child must die");
    if let Ok(status) = waited {
        assert!(!status.success());
    }
    assert!(!alive(pid));
}

#[tokio::test]
async fn exited_registered_child_stops_checking_true() {
    let (mut client, _task) = start_daemon().await;

    // Register a pid that is a child of the daemon process itself and leak
    // the handle: once it dies, only the daemon can reap the zombie, and
    // CheckApp must still turn false.
    let child = tokio::process::Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;
    std::mem::forget(child);

    let app = client.register_app(pid).await.unwrap();
    assert!(client.check_app(app).await.unwrap());

    signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.check_app(app).await.unwrap() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "exited app still checks true"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    client.deregister_app(app).await.unwrap();
}

#[tokio::test]
async fn shutdown_tears_everything_down() {
    let (mut client, task) = start_daemon().await;

    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();
    assert!(alive(app));

    client.shutdown().await.unwrap();
    let outcome = timeout(Duration::from_secs(10), task)
        .await
        .expect("daemon must exit")
        .unwrap();
    assert!(outcome.is_ok());
    assert!(!alive(app));
}

#[tokio::test]
async fn dropped_client_triggers_daemon_teardown() {
    let (mut client, task) = start_daemon().await;

    let app = client
        .fork_exec_app(sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();

    drop(client);
    let outcome = timeout(Duration::from_secs(10), task)
        .await
        .expect("daemon must exit on channel loss")
        .unwrap();
    assert!(outcome.is_ok());
    assert!(!alive(app));
}

#[tokio::test]
async fn forked_app_object_round_trip() {
    let (client, _task) = start_daemon().await;
    let client = Arc::new(Mutex::new(client));

    let mut app = ForkedApp::spawn(client.clone(), sleep_spec("30"), StdioSlots::none())
        .await
        .unwrap();
    assert_eq!(app.num_ranks(), 1);
    assert_eq!(app.placement().len(), 1);
    assert!(app.release_barrier().await.is_err());

    let util_pid = app
        .start_utility(vec!["/bin/sleep".into(), "30".into()])
        .await
        .unwrap();
    assert!(alive(util_pid));

    app.kill(Signal::SIGSTOP).await.unwrap();
    app.kill(Signal::SIGCONT).await.unwrap();

    let pid = app.pid();
    app.deregister().await.unwrap();
    assert!(!alive(pid));
    assert!(!alive(util_pid));

    // Deregistered is terminal.
    assert!(app.start_utility(vec!["/bin/true".into()]).await.is_err());
    assert!(app.kill(Signal::SIGTERM).await.is_err());
}
