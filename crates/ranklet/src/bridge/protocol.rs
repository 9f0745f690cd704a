//! Wire protocol types for tool-daemon communication.
//!
//! One half-duplex channel: the tool writes a [`Request`], then blocks on the
//! matching [`Response`]. No pipelining — at most one outstanding request per
//! channel, which is what lets the daemon mutate its tracked state from a
//! single consumer loop.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::error::ValidationError;

/// Handle for a tracked application: the pid of its main process. An MPIR
/// session shares the handle of the launcher it controls.
pub type AppId = i32;

/// Request discriminants as they appear on the wire (i64, little-endian).
pub mod req_tag {
    pub const FORK_EXEC_APP: i64 = 0;
    pub const FORK_EXEC_UTIL: i64 = 1;
    pub const LAUNCH_MPIR: i64 = 2;
    pub const ATTACH_MPIR: i64 = 3;
    pub const RELEASE_MPIR: i64 = 4;
    pub const TERMINATE_MPIR: i64 = 5;
    pub const READ_SYMBOL_STRING: i64 = 6;
    pub const REGISTER_APP: i64 = 7;
    pub const REGISTER_UTIL: i64 = 8;
    pub const DEREGISTER_APP: i64 = 9;
    pub const CHECK_APP: i64 = 10;
    pub const WAIT_APP: i64 = 11;
    pub const SHUTDOWN: i64 = 12;
}

/// Response discriminants as they appear on the wire (i64, little-endian).
pub mod resp_tag {
    pub const OK: i64 = 0;
    pub const PID: i64 = 1;
    pub const MPIR: i64 = 2;
    pub const STRING: i64 = 3;
}

/// Whether a utility launch returns at spawn or at exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Asynchronous,
    Synchronous,
}

impl RunMode {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Asynchronous => 0,
            Self::Synchronous => 1,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Asynchronous),
            1 => Some(Self::Synchronous),
            _ => None,
        }
    }
}

/// Stdio descriptors accompanying a launch request via SCM_RIGHTS.
///
/// A `None` slot means the spawned process gets `/dev/null` for that stream.
/// The flags byte on the wire records which slots are populated, in
/// stdin/stdout/stderr bit order, so the receiver knows how many ancillary
/// descriptors to expect and how to assign them.
#[derive(Debug, Default)]
pub struct StdioSlots {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl StdioSlots {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }

    pub fn flags(&self) -> u8 {
        (self.stdin.is_some() as u8)
            | (self.stdout.is_some() as u8) << 1
            | (self.stderr.is_some() as u8) << 2
    }

    /// Populated slots in bit order, matching the ancillary fd array.
    pub fn borrowed(&self) -> Vec<BorrowedFd<'_>> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .flatten()
            .map(|fd| fd.as_fd())
            .collect()
    }

    /// Reassemble slots from a flags byte plus the received fd array.
    pub fn from_flags(flags: u8, mut fds: Vec<OwnedFd>) -> Self {
        fds.reverse();
        let mut take = |bit: u8| {
            if flags & (1 << bit) != 0 {
                fds.pop()
            } else {
                None
            }
        };
        Self {
            stdin: take(0),
            stdout: take(1),
            stderr: take(2),
        }
    }
}

/// Executable, arguments, and environment for a launch-style request.
///
/// On the wire: NUL-terminated exe path, `argv.len()` NUL-terminated argument
/// strings, an empty sentinel, `env.len()` NUL-terminated `NAME=VALUE` strings,
/// an empty sentinel. The counts travel in the fixed header — an empty string
/// is a legal argv/env element and only position tells it apart from a
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exe: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

impl LaunchSpec {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            argv: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn envs<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    /// Reject environment strings with no `=` or an empty name before they
    /// ever reach the wire. `""`, `"="`, and `"=NAME"` are all malformed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for entry in &self.env {
            match entry.find('=') {
                None => return Err(ValidationError::EnvMissingSeparator(entry.clone())),
                Some(0) => return Err(ValidationError::EnvEmptyName(entry.clone())),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Requests the tool sends to the daemon.
#[derive(Debug)]
pub enum Request {
    /// Spawn a process and track it as a new app.
    ForkExecApp { spec: LaunchSpec, stdio: StdioSlots },

    /// Spawn a process tracked as a utility of `app`. Synchronous mode blocks
    /// the response until the utility exits.
    ForkExecUtil {
        app: AppId,
        mode: RunMode,
        spec: LaunchSpec,
        stdio: StdioSlots,
    },

    /// Spawn a launcher under MPIR control, run it to its startup breakpoint,
    /// and return the extracted process table.
    LaunchMpir { spec: LaunchSpec, stdio: StdioSlots },

    /// Attach to a running launcher and extract its process table.
    AttachMpir { launcher_pid: i32 },

    /// Let a held launcher past its breakpoint; the session id dies, the job
    /// keeps running.
    ReleaseMpir { session: AppId },

    /// Stop controlling a launcher without releasing its breakpoint state.
    TerminateMpir { session: AppId },

    /// Read a NUL-terminated string out of the controlled launcher's memory.
    ReadSymbolString { session: AppId, symbol: String },

    /// Adopt an already-forked process as a tracked app.
    RegisterApp { pid: i32 },

    /// Adopt an already-forked process as a utility of `app`.
    RegisterUtil { app: AppId, pid: i32 },

    /// Terminate all utilities of `app`, then the app, then drop tracking.
    DeregisterApp { app: AppId },

    /// Is the app still tracked and alive?
    CheckApp { app: AppId },

    /// Block until the app's process exits.
    WaitApp { app: AppId },

    /// Deregister everything and exit the daemon.
    Shutdown,
}

impl Request {
    pub fn tag(&self) -> i64 {
        match self {
            Self::ForkExecApp { .. } => req_tag::FORK_EXEC_APP,
            Self::ForkExecUtil { .. } => req_tag::FORK_EXEC_UTIL,
            Self::LaunchMpir { .. } => req_tag::LAUNCH_MPIR,
            Self::AttachMpir { .. } => req_tag::ATTACH_MPIR,
            Self::ReleaseMpir { .. } => req_tag::RELEASE_MPIR,
            Self::TerminateMpir { .. } => req_tag::TERMINATE_MPIR,
            Self::ReadSymbolString { .. } => req_tag::READ_SYMBOL_STRING,
            Self::RegisterApp { .. } => req_tag::REGISTER_APP,
            Self::RegisterUtil { .. } => req_tag::REGISTER_UTIL,
            Self::DeregisterApp { .. } => req_tag::DEREGISTER_APP,
            Self::CheckApp { .. } => req_tag::CHECK_APP,
            Self::WaitApp { .. } => req_tag::WAIT_APP,
            Self::Shutdown => req_tag::SHUTDOWN,
        }
    }
}

/// One rank's placement: rank is implicit in table position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcTableEntry {
    pub pid: i32,
    pub hostname: String,
}

/// Everything an MPIR launch or attach produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpirData {
    pub session: AppId,
    pub launcher_pid: i32,
    pub job_id: u32,
    pub step_id: u32,
    pub proctable: Vec<ProcTableEntry>,
}

/// Responses the daemon sends back, one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success flag for operations with no payload. `success = false` carries
    /// an OperationError the daemon already logged.
    Ok { success: bool },

    /// A pid: the daemon's own (handshake), an issued app handle, or a
    /// spawned utility. Negative on failure.
    Pid { pid: i32 },

    Mpir(MpirData),

    /// Symbol read result; `None` when the read failed.
    String { value: Option<String> },
}

impl Response {
    pub fn tag(&self) -> i64 {
        match self {
            Self::Ok { .. } => resp_tag::OK,
            Self::Pid { .. } => resp_tag::PID,
            Self::Mpir(_) => resp_tag::MPIR,
            Self::String { .. } => resp_tag::STRING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_validation_rejects_malformed() {
        for bad in ["", "=", "=EMPTYNAME"] {
            let spec = LaunchSpec::new("/bin/true").envs([bad]);
            assert!(spec.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn env_validation_accepts_name_value() {
        let spec = LaunchSpec::new("/bin/true").envs(["A=1", "PATH=", "X=a=b"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn stdio_flags_match_slots() {
        assert_eq!(StdioSlots::none().flags(), 0);

        let devnull = std::fs::File::open("/dev/null").unwrap();
        let slots = StdioSlots {
            stdin: None,
            stdout: Some(devnull.into()),
            stderr: None,
        };
        assert_eq!(slots.flags(), 0b010);
        assert_eq!(slots.borrowed().len(), 1);
    }

    #[test]
    fn stdio_from_flags_assigns_in_bit_order() {
        let out: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let err: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let slots = StdioSlots::from_flags(0b110, vec![out, err]);
        assert!(slots.stdin.is_none());
        assert!(slots.stdout.is_some());
        assert!(slots.stderr.is_some());
    }
}
