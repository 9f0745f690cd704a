//! Binary wire codec: fixed-width tags and fields, counted NUL-string
//! sections, count-prefixed pid arrays.
//!
//! Layout rules (everything little-endian):
//! - tags are `i64`, sent on their own so ancillary descriptors can attach to
//!   the first byte *after* the tag (the receiver does not know whether to
//!   expect descriptors until it has read the tag);
//! - launch requests carry `argc`/`envc` in their fixed fields and still write
//!   the end-of-list sentinels. The decoder reads exactly the counted number
//!   of strings, then verifies each sentinel — an empty string is a legal
//!   element and only position distinguishes it from a sentinel;
//! - any malformed trailing section (missing sentinel, truncated array,
//!   over-long string) is a [`ProtocolError`], never tolerated.

use tokio_util::bytes::{BufMut, BytesMut};

use crate::error::{Error, ProtocolError, Result, TransportError, ValidationError};

use super::protocol::{
    LaunchSpec, MpirData, ProcTableEntry, Request, Response, RunMode, StdioSlots, req_tag,
    resp_tag,
};
use super::transport::{MAX_PASSED_FDS, Transport};

/// Upper bound on any single wire string. Paths, hostnames, and env entries
/// are all far below this; anything larger is corruption.
const MAX_STRING_LEN: usize = 1 << 20;

/// Upper bound on a process-table length; no machine has more ranks.
const MAX_PROCTABLE_LEN: u32 = 1 << 24;

/// One half-duplex request/response channel over a [`Transport`].
pub struct Channel<T> {
    transport: T,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn supports_fd_passing(&self) -> bool {
        self.transport.supports_fd_passing()
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    // ---------------------------------------------------------------- tool side

    /// Encode and write one request. Stdio descriptors ride along as
    /// ancillary data; sending them over a transport that cannot carry them
    /// is a local [`ValidationError`], not a silent downgrade.
    pub async fn send_request(&mut self, req: &Request) -> Result<()> {
        let mut tag = BytesMut::with_capacity(8);
        tag.put_i64_le(req.tag());

        match req {
            Request::ForkExecApp { spec, stdio } | Request::LaunchMpir { spec, stdio } => {
                spec.validate()?;
                self.check_stdio(stdio)?;

                let mut body = BytesMut::new();
                body.put_u8(stdio.flags());
                put_launch_spec(&mut body, spec);

                self.transport.send(&tag).await?;
                self.transport
                    .send_with_fds(&body, &stdio.borrowed())
                    .await?;
            }

            Request::ForkExecUtil {
                app,
                mode,
                spec,
                stdio,
            } => {
                spec.validate()?;
                self.check_stdio(stdio)?;

                let mut body = BytesMut::new();
                body.put_i32_le(*app);
                body.put_u8(mode.to_wire());
                body.put_u8(stdio.flags());
                put_launch_spec(&mut body, spec);

                self.transport.send(&tag).await?;
                self.transport
                    .send_with_fds(&body, &stdio.borrowed())
                    .await?;
            }

            Request::AttachMpir { launcher_pid } => {
                tag.put_i32_le(*launcher_pid);
                self.transport.send(&tag).await?;
            }

            Request::ReleaseMpir { session } | Request::TerminateMpir { session } => {
                tag.put_i32_le(*session);
                self.transport.send(&tag).await?;
            }

            Request::ReadSymbolString { session, symbol } => {
                tag.put_i32_le(*session);
                put_cstring(&mut tag, symbol);
                self.transport.send(&tag).await?;
            }

            Request::RegisterApp { pid } => {
                tag.put_i32_le(*pid);
                self.transport.send(&tag).await?;
            }

            Request::RegisterUtil { app, pid } => {
                tag.put_i32_le(*app);
                tag.put_i32_le(*pid);
                self.transport.send(&tag).await?;
            }

            Request::DeregisterApp { app }
            | Request::CheckApp { app }
            | Request::WaitApp { app } => {
                tag.put_i32_le(*app);
                self.transport.send(&tag).await?;
            }

            Request::Shutdown => {
                self.transport.send(&tag).await?;
            }
        }
        Ok(())
    }

    /// Read one response of any shape; callers match the variant they expect.
    pub async fn recv_response(&mut self) -> Result<Response> {
        let tag = self.read_i64().await?;
        match tag {
            resp_tag::OK => {
                let success = self.read_u8().await? != 0;
                Ok(Response::Ok { success })
            }

            resp_tag::PID => {
                let pid = self.read_i32().await?;
                Ok(Response::Pid { pid })
            }

            resp_tag::MPIR => {
                let session = self.read_i32().await?;
                let launcher_pid = self.read_i32().await?;
                let job_id = self.read_u32().await?;
                let step_id = self.read_u32().await?;
                let count = self.read_u32().await?;
                if count > MAX_PROCTABLE_LEN {
                    return Err(ProtocolError::Malformed("absurd process table length").into());
                }

                let mut pids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    pids.push(self.read_trailing_i32().await?);
                }
                let mut proctable = Vec::with_capacity(count as usize);
                for pid in pids {
                    let hostname = self.read_trailing_cstring().await?;
                    proctable.push(ProcTableEntry { pid, hostname });
                }

                Ok(Response::Mpir(MpirData {
                    session,
                    launcher_pid,
                    job_id,
                    step_id,
                    proctable,
                }))
            }

            resp_tag::STRING => {
                let success = self.read_u8().await? != 0;
                let value = if success {
                    Some(self.read_trailing_cstring().await?)
                } else {
                    None
                };
                Ok(Response::String { value })
            }

            other => Err(ProtocolError::UnknownResponseTag(other).into()),
        }
    }

    // -------------------------------------------------------------- daemon side

    /// Read one request, collecting any ancillary stdio descriptors.
    pub async fn recv_request(&mut self) -> Result<Request> {
        let tag = self.read_i64().await?;
        match tag {
            req_tag::FORK_EXEC_APP | req_tag::LAUNCH_MPIR => {
                let (stdio, spec) = self.read_launch_body().await?;
                Ok(if tag == req_tag::FORK_EXEC_APP {
                    Request::ForkExecApp { spec, stdio }
                } else {
                    Request::LaunchMpir { spec, stdio }
                })
            }

            req_tag::FORK_EXEC_UTIL => {
                // app id + run mode precede the launch body; descriptors are
                // attached to the first byte of this fixed chunk.
                let mut fixed = [0u8; 6];
                let fds = self.recv_fixed_with_fds(&mut fixed).await?;
                let app = i32::from_le_bytes(fixed[0..4].try_into().unwrap());
                let mode = RunMode::from_wire(fixed[4])
                    .ok_or(ProtocolError::Malformed("bad utility run mode"))?;
                let stdio = self.assemble_stdio(fixed[5], fds)?;
                let spec = self.read_launch_strings().await?;
                Ok(Request::ForkExecUtil {
                    app,
                    mode,
                    spec,
                    stdio,
                })
            }

            req_tag::ATTACH_MPIR => Ok(Request::AttachMpir {
                launcher_pid: self.read_i32().await?,
            }),

            req_tag::RELEASE_MPIR => Ok(Request::ReleaseMpir {
                session: self.read_i32().await?,
            }),

            req_tag::TERMINATE_MPIR => Ok(Request::TerminateMpir {
                session: self.read_i32().await?,
            }),

            req_tag::READ_SYMBOL_STRING => {
                let session = self.read_i32().await?;
                let symbol = self.read_trailing_cstring().await?;
                Ok(Request::ReadSymbolString { session, symbol })
            }

            req_tag::REGISTER_APP => Ok(Request::RegisterApp {
                pid: self.read_i32().await?,
            }),

            req_tag::REGISTER_UTIL => {
                let app = self.read_i32().await?;
                let pid = self.read_i32().await?;
                Ok(Request::RegisterUtil { app, pid })
            }

            req_tag::DEREGISTER_APP => Ok(Request::DeregisterApp {
                app: self.read_i32().await?,
            }),

            req_tag::CHECK_APP => Ok(Request::CheckApp {
                app: self.read_i32().await?,
            }),

            req_tag::WAIT_APP => Ok(Request::WaitApp {
                app: self.read_i32().await?,
            }),

            req_tag::SHUTDOWN => Ok(Request::Shutdown),

            other => Err(ProtocolError::UnknownRequestTag(other).into()),
        }
    }

    /// Encode and write one response.
    pub async fn send_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64_le(resp.tag());

        match resp {
            Response::Ok { success } => buf.put_u8(*success as u8),

            Response::Pid { pid } => buf.put_i32_le(*pid),

            Response::Mpir(data) => {
                buf.put_i32_le(data.session);
                buf.put_i32_le(data.launcher_pid);
                buf.put_u32_le(data.job_id);
                buf.put_u32_le(data.step_id);
                buf.put_u32_le(data.proctable.len() as u32);
                for entry in &data.proctable {
                    buf.put_i32_le(entry.pid);
                }
                for entry in &data.proctable {
                    put_cstring(&mut buf, &entry.hostname);
                }
            }

            Response::String { value } => {
                buf.put_u8(value.is_some() as u8);
                if let Some(s) = value {
                    put_cstring(&mut buf, s);
                }
            }
        }

        self.transport.send(&buf).await
    }

    // ------------------------------------------------------------------ helpers

    fn check_stdio(&self, stdio: &StdioSlots) -> Result<(), ValidationError> {
        if !stdio.is_empty() && !self.transport.supports_fd_passing() {
            return Err(ValidationError::FdsOnNonPassingTransport);
        }
        Ok(())
    }

    async fn read_launch_body(&mut self) -> Result<(StdioSlots, LaunchSpec)> {
        let mut fixed = [0u8; 1];
        let fds = self.recv_fixed_with_fds(&mut fixed).await?;
        let stdio = self.assemble_stdio(fixed[0], fds)?;
        let spec = self.read_launch_strings().await?;
        Ok((stdio, spec))
    }

    async fn recv_fixed_with_fds(
        &mut self,
        fixed: &mut [u8],
    ) -> Result<Vec<std::os::fd::OwnedFd>> {
        let max_fds = if self.transport.supports_fd_passing() {
            MAX_PASSED_FDS
        } else {
            0
        };
        Ok(self.transport.recv_with_fds(fixed, max_fds).await?)
    }

    fn assemble_stdio(
        &self,
        flags: u8,
        fds: Vec<std::os::fd::OwnedFd>,
    ) -> Result<StdioSlots> {
        let expected = (flags & 0b111).count_ones() as usize;
        if flags & !0b111 != 0 {
            return Err(ProtocolError::Malformed("bad stdio flags").into());
        }
        if expected != fds.len() {
            return Err(TransportError::FdCountMismatch {
                expected,
                actual: fds.len(),
            }
            .into());
        }
        Ok(StdioSlots::from_flags(flags, fds))
    }

    async fn read_launch_strings(&mut self) -> Result<LaunchSpec> {
        let argc = self.read_u32().await? as usize;
        let envc = self.read_u32().await? as usize;
        if argc > MAX_STRING_LEN || envc > MAX_STRING_LEN {
            return Err(ProtocolError::Malformed("absurd argv/env count").into());
        }

        let exe = self.read_trailing_cstring().await?;

        let mut argv = Vec::with_capacity(argc);
        for _ in 0..argc {
            argv.push(self.read_trailing_cstring().await?);
        }
        self.expect_sentinel("argument-list").await?;

        let mut env = Vec::with_capacity(envc);
        for _ in 0..envc {
            env.push(self.read_trailing_cstring().await?);
        }
        self.expect_sentinel("environment-list").await?;

        Ok(LaunchSpec { exe, argv, env })
    }

    async fn expect_sentinel(&mut self, section: &'static str) -> Result<()> {
        let s = self.read_trailing_cstring().await?;
        if !s.is_empty() {
            return Err(ProtocolError::MissingSentinel { section }.into());
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8, TransportError> {
        let mut b = [0u8; 1];
        self.transport.recv_exact(&mut b).await?;
        Ok(b[0])
    }

    async fn read_i32(&mut self) -> Result<i32, TransportError> {
        let mut b = [0u8; 4];
        self.transport.recv_exact(&mut b).await?;
        Ok(i32::from_le_bytes(b))
    }

    async fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut b = [0u8; 4];
        self.transport.recv_exact(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    async fn read_i64(&mut self) -> Result<i64, TransportError> {
        let mut b = [0u8; 8];
        self.transport.recv_exact(&mut b).await?;
        Ok(i64::from_le_bytes(b))
    }

    /// Trailing-section reads map EOF to ProtocolError: losing the channel
    /// mid-message means the frame was truncated, which is corruption from
    /// the decoder's point of view.
    async fn read_trailing_i32(&mut self) -> Result<i32> {
        self.read_i32().await.map_err(truncated)
    }

    async fn read_trailing_cstring(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let mut b = [0u8; 1];
            self.transport.recv_exact(&mut b).await.map_err(truncated)?;
            if b[0] == 0 {
                break;
            }
            bytes.push(b[0]);
            if bytes.len() > MAX_STRING_LEN {
                return Err(ProtocolError::Malformed("unterminated string").into());
            }
        }
        String::from_utf8(bytes)
            .map_err(ProtocolError::InvalidString)
            .map_err(Error::Protocol)
    }
}

fn truncated(e: TransportError) -> Error {
    match e {
        TransportError::Closed => {
            Error::Protocol(ProtocolError::Malformed("truncated trailing data"))
        }
        other => Error::Transport(other),
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_launch_spec(buf: &mut BytesMut, spec: &LaunchSpec) {
    buf.put_u32_le(spec.argv.len() as u32);
    buf.put_u32_le(spec.env.len() as u32);
    put_cstring(buf, &spec.exe);
    for arg in &spec.argv {
        put_cstring(buf, arg);
    }
    buf.put_u8(0); // end-of-argument-list sentinel
    for entry in &spec.env {
        put_cstring(buf, entry);
    }
    buf.put_u8(0); // end-of-environment-list sentinel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::RelayedTransport;
    use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf, duplex, split};

    type TestTransport =
        RelayedTransport<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>;

    fn channel_pair() -> (Channel<TestTransport>, Channel<TestTransport>) {
        let (a, b) = duplex(1 << 16);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            Channel::new(RelayedTransport::new(ar, aw)),
            Channel::new(RelayedTransport::new(br, bw)),
        )
    }

    #[tokio::test]
    async fn empty_argv_elements_roundtrip_exactly() {
        let (mut tool, mut daemon) = channel_pair();

        // Seven elements, several empty: position alone separates elements
        // from sentinels.
        let argv = vec!["", "", "", "X", "", "", ""];
        let req = Request::ForkExecApp {
            spec: LaunchSpec::new("/bin/echo").args(argv.clone()),
            stdio: StdioSlots::none(),
        };

        tool.send_request(&req).await.unwrap();
        match daemon.recv_request().await.unwrap() {
            Request::ForkExecApp { spec, .. } => {
                assert_eq!(spec.exe, "/bin/echo");
                assert_eq!(spec.argv, argv);
                assert!(spec.env.is_empty());
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn util_launch_roundtrips_with_mode_and_env() {
        let (mut tool, mut daemon) = channel_pair();

        let req = Request::ForkExecUtil {
            app: 7,
            mode: RunMode::Synchronous,
            spec: LaunchSpec::new("/usr/bin/env")
                .args(["env"])
                .envs(["A=1", "B=two"]),
            stdio: StdioSlots::none(),
        };
        tool.send_request(&req).await.unwrap();

        match daemon.recv_request().await.unwrap() {
            Request::ForkExecUtil {
                app, mode, spec, ..
            } => {
                assert_eq!(app, 7);
                assert_eq!(mode, RunMode::Synchronous);
                assert_eq!(spec.env, vec!["A=1", "B=two"]);
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fixed_field_requests_roundtrip() {
        let (mut tool, mut daemon) = channel_pair();

        for req in [
            Request::AttachMpir { launcher_pid: 4242 },
            Request::ReleaseMpir { session: 3 },
            Request::TerminateMpir { session: 4 },
            Request::RegisterApp { pid: 99 },
            Request::RegisterUtil { app: 1, pid: 100 },
            Request::DeregisterApp { app: 1 },
            Request::CheckApp { app: 2 },
            Request::WaitApp { app: 2 },
            Request::Shutdown,
        ] {
            let tag = req.tag();
            tool.send_request(&req).await.unwrap();
            let got = daemon.recv_request().await.unwrap();
            assert_eq!(got.tag(), tag);
        }

        tool.send_request(&Request::ReadSymbolString {
            session: 5,
            symbol: "totalview_jobid".into(),
        })
        .await
        .unwrap();
        match daemon.recv_request().await.unwrap() {
            Request::ReadSymbolString { session, symbol } => {
                assert_eq!(session, 5);
                assert_eq!(symbol, "totalview_jobid");
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_roundtrip() {
        let (mut tool, mut daemon) = channel_pair();

        let mpir = Response::Mpir(MpirData {
            session: 11,
            launcher_pid: 1234,
            job_id: 77,
            step_id: 0,
            proctable: vec![
                ProcTableEntry {
                    pid: 2001,
                    hostname: "nid000001".into(),
                },
                ProcTableEntry {
                    pid: 2002,
                    hostname: "nid000002".into(),
                },
            ],
        });

        for resp in [
            Response::Ok { success: true },
            Response::Ok { success: false },
            Response::Pid { pid: 31337 },
            mpir,
            Response::String {
                value: Some("1842.0".into()),
            },
            Response::String { value: None },
        ] {
            daemon.send_response(&resp).await.unwrap();
            let got = tool.recv_response().await.unwrap();
            assert_eq!(got, resp);
        }
    }

    #[tokio::test]
    async fn check_app_wire_layout_is_pinned() {
        // Hand-crafted bytes: tag 10 (CheckApp) as i64 LE, handle 5 as i32 LE.
        let (a, b) = duplex(256);
        let (_ar, mut aw) = split(a);
        let (br, bw) = split(b);
        let mut daemon = Channel::new(RelayedTransport::new(br, bw));

        let mut raw = Vec::new();
        raw.extend_from_slice(&10i64.to_le_bytes());
        raw.extend_from_slice(&5i32.to_le_bytes());
        aw.write_all(&raw).await.unwrap();

        match daemon.recv_request().await.unwrap() {
            Request::CheckApp { app } => assert_eq!(app, 5),
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_sentinel_is_protocol_error() {
        let (a, b) = duplex(1024);
        let (_ar, mut aw) = split(a);
        let (br, bw) = split(b);
        let mut daemon = Channel::new(RelayedTransport::new(br, bw));

        // ForkExecApp claiming argc=1, but the sentinel slot holds "oops".
        let mut raw = Vec::new();
        raw.extend_from_slice(&0i64.to_le_bytes()); // tag
        raw.push(0); // stdio flags
        raw.extend_from_slice(&1u32.to_le_bytes()); // argc
        raw.extend_from_slice(&0u32.to_le_bytes()); // envc
        raw.extend_from_slice(b"/bin/true\0");
        raw.extend_from_slice(b"arg0\0");
        raw.extend_from_slice(b"oops\0"); // should be the empty sentinel
        raw.extend_from_slice(b"\0"); // env sentinel
        aw.write_all(&raw).await.unwrap();

        let err = daemon.recv_request().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MissingSentinel { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_trailing_data_is_protocol_error() {
        // Write through the unsplit stream so dropping it delivers EOF.
        let (mut a, b) = duplex(1024);
        let (br, bw) = split(b);
        let mut tool = Channel::new(RelayedTransport::new(br, bw));

        // Mpir response header promising 2 entries, then the stream dies.
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i64.to_le_bytes()); // tag: Mpir
        raw.extend_from_slice(&1i32.to_le_bytes()); // session
        raw.extend_from_slice(&100i32.to_le_bytes()); // launcher pid
        raw.extend_from_slice(&0u32.to_le_bytes()); // job id
        raw.extend_from_slice(&0u32.to_le_bytes()); // step id
        raw.extend_from_slice(&2u32.to_le_bytes()); // count
        raw.extend_from_slice(&2001i32.to_le_bytes()); // only one pid
        a.write_all(&raw).await.unwrap();
        drop(a);

        let err = tool.recv_response().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Malformed("truncated trailing data"))
        ));
    }

    #[tokio::test]
    async fn invalid_env_never_reaches_the_wire() {
        let (mut tool, _daemon) = channel_pair();

        for bad in ["", "=", "=EMPTYNAME"] {
            for req in [
                Request::ForkExecApp {
                    spec: LaunchSpec::new("/bin/true").envs([bad]),
                    stdio: StdioSlots::none(),
                },
                Request::ForkExecUtil {
                    app: 1,
                    mode: RunMode::Asynchronous,
                    spec: LaunchSpec::new("/bin/true").envs([bad]),
                    stdio: StdioSlots::none(),
                },
            ] {
                let err = tool.send_request(&req).await.unwrap_err();
                assert!(matches!(err, Error::Validation(_)), "{bad:?} got through");
            }
        }
    }

    #[tokio::test]
    async fn stdio_fds_refused_on_relayed_transport() {
        let (mut tool, _daemon) = channel_pair();

        let devnull = std::fs::File::open("/dev/null").unwrap();
        let req = Request::ForkExecApp {
            spec: LaunchSpec::new("/bin/true"),
            stdio: StdioSlots {
                stdin: None,
                stdout: Some(devnull.into()),
                stderr: None,
            },
        };
        let err = tool.send_request(&req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::FdsOnNonPassingTransport)
        ));
    }
}
