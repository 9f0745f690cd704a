//! Process-control primitive for launcher binaries.
//!
//! Wraps ptrace: spawn-traced or attach, software breakpoints, word-granular
//! memory access, and symbol lookup via the launcher's ELF tables. Everything
//! here must run on the thread that attached — ptrace requests from any other
//! thread fail with ESRCH. The controller gives every session a dedicated
//! thread for exactly this reason.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::bridge::protocol::{LaunchSpec, StdioSlots};
use crate::error::OperationError;

/// x86_64 int3.
#[cfg(target_arch = "x86_64")]
const TRAP_INSN: u8 = 0xcc;

fn optrace(op: &'static str, e: nix::Error) -> OperationError {
    OperationError::new(format!("ptrace {op} failed: {e}"))
}

fn unsupported() -> OperationError {
    OperationError::new("MPIR control is only implemented for x86_64 targets")
}

/// A launcher process under ptrace control, stopped or running.
pub struct Inferior {
    pid: Pid,
    exe: PathBuf,
    symbols: HashMap<String, u64>,
    /// breakpoint address -> saved original word
    breakpoints: HashMap<u64, i64>,
    terminated: bool,
    /// Non-trap stop signal to re-deliver on the next continue.
    pending_signal: Option<Signal>,
    /// True when we forked this process ourselves, so its exit status is
    /// ours to collect.
    spawned_child: bool,
}

impl Inferior {
    /// Fork/exec `spec` under trace. Returns with the child stopped at its
    /// exec trap, symbols loaded, no ranks running.
    pub fn spawn(spec: &LaunchSpec, stdio: StdioSlots) -> Result<Self, OperationError> {
        if !cfg!(target_arch = "x86_64") {
            return Err(unsupported());
        }

        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut cmd = Command::new(&spec.exe);
        if let Some((argv0, rest)) = spec.argv.split_first() {
            cmd.arg0(argv0);
            cmd.args(rest);
        }
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

        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| OperationError::new(format!("failed to spawn launcher {}: {e}", spec.exe)))?;
        let pid = Pid::from_raw(child.id() as i32);
        // The session thread owns the process from here; exits are collected
        // through waitpid, not through the Child handle.
        std::mem::forget(child);

        // Resolve symlinks up front: /proc/<pid>/maps records canonical
        // paths, and the load-base scan matches against them.
        let exe = std::fs::canonicalize(&spec.exe).unwrap_or_else(|_| PathBuf::from(&spec.exe));
        let mut inferior = Self {
            pid,
            exe,
            symbols: HashMap::new(),
            breakpoints: HashMap::new(),
            terminated: false,
            pending_signal: None,
            spawned_child: true,
        };

        inferior.expect_stop()?;
        // If this daemon dies, the held launcher must not outlive it.
        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL)
            .map_err(|e| optrace("setoptions", e))?;
        inferior.load_symbols()?;
        tracing::debug!(pid = pid.as_raw(), exe = %inferior.exe.display(), "launcher spawned under trace");
        Ok(inferior)
    }

    /// Attach to a running launcher. Returns with it stopped.
    pub fn attach(launcher_pid: i32) -> Result<Self, OperationError> {
        if !cfg!(target_arch = "x86_64") {
            return Err(unsupported());
        }

        let pid = Pid::from_raw(launcher_pid);
        let exe = std::fs::read_link(format!("/proc/{launcher_pid}/exe"))
            .map_err(|e| OperationError::new(format!("cannot resolve launcher binary: {e}")))?;

        ptrace::attach(pid).map_err(|e| optrace("attach", e))?;
        let mut inferior = Self {
            pid,
            exe,
            symbols: HashMap::new(),
            breakpoints: HashMap::new(),
            terminated: false,
            pending_signal: None,
            spawned_child: false,
        };
        inferior.expect_stop()?;
        inferior.load_symbols()?;
        tracing::debug!(pid = launcher_pid, exe = %inferior.exe.display(), "attached to launcher");
        Ok(inferior)
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_spawned_child(&self) -> bool {
        self.spawned_child
    }

    // ---------------------------------------------------------------- symbols

    fn load_symbols(&mut self) -> Result<(), OperationError> {
        let bytes = std::fs::read(&self.exe)
            .map_err(|e| OperationError::new(format!("cannot read launcher binary: {e}")))?;
        let elf = goblin::elf::Elf::parse(&bytes)
            .map_err(|e| OperationError::new(format!("cannot parse launcher binary: {e}")))?;

        // Position-independent executables need the runtime load base.
        let bias = if elf.header.e_type == goblin::elf::header::ET_DYN {
            self.load_base()?
        } else {
            0
        };

        for sym in elf.syms.iter() {
            if sym.st_value == 0 {
                continue;
            }
            if let Some(name) = elf.strtab.get_at(sym.st_name)
                && !name.is_empty()
            {
                self.symbols
                    .entry(name.to_string())
                    .or_insert(sym.st_value + bias);
            }
        }
        // dynsym names live in the dynamic string table.
        for sym in elf.dynsyms.iter() {
            if sym.st_value == 0 {
                continue;
            }
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name)
                && !name.is_empty()
            {
                self.symbols
                    .entry(name.to_string())
                    .or_insert(sym.st_value + bias);
            }
        }

        tracing::trace!(count = self.symbols.len(), "loaded launcher symbols");
        Ok(())
    }

    fn load_base(&self) -> Result<u64, OperationError> {
        let maps = std::fs::read_to_string(format!("/proc/{}/maps", self.pid))
            .map_err(|e| OperationError::new(format!("cannot read launcher maps: {e}")))?;
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let range = fields.next().unwrap_or("");
            // perms, offset, dev, inode precede the pathname.
            let path = fields.nth(3).and_then(|_| fields.next()).unwrap_or("");
            if Path::new(path) == self.exe
                && let Some((start, _)) = range.split_once('-')
                && let Ok(base) = u64::from_str_radix(start, 16)
            {
                return Ok(base);
            }
        }
        Err(OperationError::new(
            "launcher binary not found in its own address space",
        ))
    }

    pub fn symbol_addr(&self, name: &str) -> Result<u64, OperationError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| OperationError::new(format!("launcher defines no symbol {name:?}")))
    }

    // ----------------------------------------------------------------- memory

    pub fn read_word(&self, addr: u64) -> Result<i64, OperationError> {
        ptrace::read(self.pid, addr as *mut c_void).map_err(|e| optrace("read", e))
    }

    fn write_word(&self, addr: u64, word: i64) -> Result<(), OperationError> {
        // Writing target memory is inherently racy with the target; the
        // target is stopped whenever we get here.
        ptrace::write(self.pid, addr as *mut c_void, word).map_err(|e| optrace("write", e))
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32, OperationError> {
        let word = self.read_word(addr & !7)?;
        let shift = (addr & 7) * 8;
        Ok((word as u64 >> shift) as i32)
    }

    pub fn write_i32(&self, addr: u64, value: i32) -> Result<(), OperationError> {
        // Read-modify-write the containing word to leave neighbors alone.
        let base = addr & !7;
        let shift = (addr & 7) * 8;
        let word = self.read_word(base)? as u64;
        let mask = 0xffff_ffffu64 << shift;
        let merged = (word & !mask) | ((value as u32 as u64) << shift);
        self.write_word(base, merged as i64)
    }

    pub fn read_ptr(&self, addr: u64) -> Result<u64, OperationError> {
        // Pointers are word-aligned in the MPIR structures we touch.
        Ok(self.read_word(addr)? as u64)
    }

    /// Read value of a named integer variable.
    pub fn read_i32_symbol(&self, name: &str) -> Result<i32, OperationError> {
        self.read_i32(self.symbol_addr(name)?)
    }

    pub fn write_i32_symbol(&self, name: &str, value: i32) -> Result<(), OperationError> {
        self.write_i32(self.symbol_addr(name)?, value)
    }

    /// NUL-terminated string at `addr` in the target's address space.
    pub fn read_cstring(&self, addr: u64) -> Result<String, OperationError> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        'outer: loop {
            let word = self.read_word(cursor)?;
            for byte in word.to_ne_bytes() {
                if byte == 0 {
                    break 'outer;
                }
                bytes.push(byte);
                if bytes.len() > 1 << 16 {
                    return Err(OperationError::new("unterminated string in launcher memory"));
                }
            }
            cursor += 8;
        }
        String::from_utf8(bytes)
            .map_err(|_| OperationError::new("launcher string is not valid UTF-8"))
    }

    // ------------------------------------------------------------ breakpoints

    pub fn set_breakpoint(&mut self, name: &str) -> Result<(), OperationError> {
        let addr = self.symbol_addr(name)?;
        if self.breakpoints.contains_key(&addr) {
            return Ok(());
        }
        let saved = self.read_word(addr)?;
        self.write_word(addr, insert_trap(saved))?;
        self.breakpoints.insert(addr, saved);
        tracing::trace!(addr = format_args!("{addr:#x}"), symbol = name, "breakpoint set");
        Ok(())
    }

    fn clear_breakpoints(&mut self) -> Result<(), OperationError> {
        let saved: Vec<(u64, i64)> = self.breakpoints.drain().collect();
        for (addr, word) in saved {
            self.write_word(addr, word)?;
        }
        Ok(())
    }

    /// Resume until the next stop. Steps over an armed breakpoint when
    /// stopped on one.
    pub fn cont(&mut self) -> Result<(), OperationError> {
        if self.terminated {
            return Err(OperationError::new("launcher has terminated"));
        }

        if let Some(addr) = self.stopped_breakpoint()? {
            // Restore the original word, single-step past it, re-arm.
            let saved = self.breakpoints[&addr];
            self.write_word(addr, saved)?;
            ptrace::step(self.pid, self.pending_signal.take())
                .map_err(|e| optrace("step", e))?;
            self.expect_stop()?;
            if self.terminated {
                return Ok(());
            }
            self.write_word(addr, insert_trap(saved))?;
        }

        ptrace::cont(self.pid, self.pending_signal.take()).map_err(|e| optrace("cont", e))?;
        self.expect_stop()
    }

    /// If stopped by one of our traps, the breakpoint address (pc rewound).
    fn stopped_breakpoint(&self) -> Result<Option<u64>, OperationError> {
        let pc = self.pc()?;
        Ok(self.breakpoints.contains_key(&pc).then_some(pc))
    }

    fn expect_stop(&mut self) -> Result<(), OperationError> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                    // Rewind past the trap byte when we are sitting just
                    // after one of ours.
                    let pc = self.pc()?;
                    if pc > 0 && self.breakpoints.contains_key(&(pc - 1)) {
                        self.set_pc(pc - 1)?;
                    }
                    return Ok(());
                }
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
                Ok(WaitStatus::Stopped(_, sig)) => {
                    // Not ours: remember it for re-delivery, report the stop.
                    self.pending_signal = Some(sig);
                    return Ok(());
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    tracing::debug!(pid = self.pid.as_raw(), code, "launcher exited");
                    self.terminated = true;
                    return Ok(());
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    tracing::debug!(pid = self.pid.as_raw(), signal = %sig, "launcher killed");
                    self.terminated = true;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(optrace("waitpid", e)),
            }
        }
    }

    /// Restore the target's code and let go of it. The target resumes.
    pub fn detach(mut self) -> Result<(), OperationError> {
        if self.terminated {
            return Ok(());
        }
        self.clear_breakpoints()?;
        ptrace::detach(self.pid, None).map_err(|e| optrace("detach", e))?;
        self.terminated = true;
        tracing::debug!(pid = self.pid.as_raw(), "detached from launcher");
        Ok(())
    }

    // -------------------------------------------------------------- registers

    #[cfg(target_arch = "x86_64")]
    fn pc(&self) -> Result<u64, OperationError> {
        let regs = ptrace::getregs(self.pid).map_err(|e| optrace("getregs", e))?;
        Ok(regs.rip)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_pc(&self, pc: u64) -> Result<(), OperationError> {
        let mut regs = ptrace::getregs(self.pid).map_err(|e| optrace("getregs", e))?;
        regs.rip = pc;
        ptrace::setregs(self.pid, regs).map_err(|e| optrace("setregs", e))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn pc(&self) -> Result<u64, OperationError> {
        Err(unsupported())
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn set_pc(&self, _pc: u64) -> Result<(), OperationError> {
        Err(unsupported())
    }
}

#[cfg(target_arch = "x86_64")]
fn insert_trap(word: i64) -> i64 {
    (word & !0xff) | TRAP_INSN as i64
}

#[cfg(not(target_arch = "x86_64"))]
fn insert_trap(word: i64) -> i64 {
    word
}
