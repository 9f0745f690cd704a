//! Tool-interface core for HPC job launchers.
//!
//! Three layers:
//! - a request/response bridge between a tool process and its supervising
//!   daemon, over a local socketpair (with stdio descriptor passing) or any
//!   relayed byte stream;
//! - a process supervisor that tracks applications and their utilities and
//!   guarantees none of them outlive the daemon;
//! - an MPIR launch/attach engine that drives a job launcher to its startup
//!   barrier and extracts the rank-to-host process table.

pub mod app;
pub mod bridge;
pub mod client;
pub mod daemon;
pub mod error;
pub mod mpir;
pub mod supervisor;
pub mod wlm;

pub use app::{App, AppState, ForkedApp, MpirApp};
pub use bridge::protocol::{AppId, LaunchSpec, MpirData, ProcTableEntry, RunMode, StdioSlots};
pub use bridge::transport::{RelayedTransport, SocketPairTransport, Transport};
pub use client::{DaemonClient, UtilStatus};
pub use daemon::Daemon;
pub use error::{Error, OperationError, ProtocolError, Result, TransportError, ValidationError};
pub use wlm::{WlmConfig, WlmKind};
