//! The MPIR debugger interface, driven over an [`Inferior`].
//!
//! A launcher that implements MPIR exports `MPIR_being_debugged`,
//! `MPIR_Breakpoint`, `MPIR_debug_state`, `MPIR_proctable`, and
//! `MPIR_proctable_size`. Setting the flag and trapping the breakpoint
//! holds every rank at startup; the proctable then names each rank's pid
//! and host. SLURM-family launchers additionally publish the job and step
//! ids as `totalview_jobid` / `totalview_stepid` strings.

use crate::bridge::protocol::{LaunchSpec, ProcTableEntry, StdioSlots};
use crate::error::OperationError;
use crate::mpir::inferior::Inferior;

const SYM_BEING_DEBUGGED: &str = "MPIR_being_debugged";
const SYM_BREAKPOINT: &str = "MPIR_Breakpoint";
const SYM_DEBUG_STATE: &str = "MPIR_debug_state";
const SYM_PROCTABLE: &str = "MPIR_proctable";
const SYM_PROCTABLE_SIZE: &str = "MPIR_proctable_size";
const SYM_JOB_ID: &str = "totalview_jobid";
const SYM_STEP_ID: &str = "totalview_stepid";

/// MPIR_debug_state value once all ranks exist and are held.
const MPIR_DEBUG_SPAWNED: i32 = 1;

/// struct MPIR_PROCDESC { char *host_name; char *executable_name; int pid; }
const PROCDESC_SIZE: u64 = 24;
const PROCDESC_HOST_OFF: u64 = 0;
const PROCDESC_PID_OFF: u64 = 16;

/// A launcher held at its MPIR barrier.
pub struct MpirInstance {
    inferior: Inferior,
}

impl MpirInstance {
    /// Launch `spec` under trace and run it to the MPIR barrier.
    pub fn launch(spec: &LaunchSpec, stdio: StdioSlots) -> Result<Self, OperationError> {
        let mut inferior = Inferior::spawn(spec, stdio)?;
        Self::arm(&mut inferior)?;

        // Run until the launcher reports its ranks spawned and held.
        loop {
            inferior.cont()?;
            if inferior.is_terminated() {
                return Err(OperationError::new(
                    "launcher terminated before reaching its startup barrier",
                ));
            }
            if inferior.read_i32_symbol(SYM_DEBUG_STATE)? == MPIR_DEBUG_SPAWNED {
                break;
            }
        }
        tracing::info!(pid = inferior.pid(), "launcher held at startup barrier");
        Ok(Self { inferior })
    }

    /// Attach to a launcher whose job may already be running, and stop it
    /// once its proctable is populated.
    pub fn attach(launcher_pid: i32) -> Result<Self, OperationError> {
        let mut inferior = Inferior::attach(launcher_pid)?;
        Self::arm(&mut inferior)?;

        // An already-running job has a proctable immediately; a starting one
        // fills it in at the breakpoint.
        while inferior.read_i32_symbol(SYM_PROCTABLE_SIZE)? == 0 {
            inferior.cont()?;
            if inferior.is_terminated() {
                return Err(OperationError::new(
                    "launcher terminated before publishing a process table",
                ));
            }
        }
        tracing::info!(pid = inferior.pid(), "attached launcher stopped with proctable");
        Ok(Self { inferior })
    }

    fn arm(inferior: &mut Inferior) -> Result<(), OperationError> {
        // Order matters: the flag must be visible before the launcher can
        // decide whether to call MPIR_Breakpoint.
        inferior.write_i32_symbol(SYM_BEING_DEBUGGED, 1)?;
        inferior.set_breakpoint(SYM_BREAKPOINT)?;
        Ok(())
    }

    pub fn launcher_pid(&self) -> i32 {
        self.inferior.pid()
    }

    /// True for launched (as opposed to attached) sessions: the launcher is
    /// our child and its exit status must be collected.
    pub fn is_spawned_child(&self) -> bool {
        self.inferior.is_spawned_child()
    }

    /// Extract the rank table: one `(pid, hostname)` pair per rank, in rank
    /// order.
    pub fn proctable(&self) -> Result<Vec<ProcTableEntry>, OperationError> {
        let size = self.inferior.read_i32_symbol(SYM_PROCTABLE_SIZE)?;
        if size < 0 {
            return Err(OperationError::new(format!(
                "launcher reports negative proctable size {size}"
            )));
        }
        let base = self
            .inferior
            .read_ptr(self.inferior.symbol_addr(SYM_PROCTABLE)?)?;
        if base == 0 && size > 0 {
            return Err(OperationError::new("launcher proctable pointer is null"));
        }

        let mut entries = Vec::with_capacity(size as usize);
        for rank in 0..size as u64 {
            let desc = base + rank * PROCDESC_SIZE;
            let host_ptr = self.inferior.read_ptr(desc + PROCDESC_HOST_OFF)?;
            let hostname = self.inferior.read_cstring(host_ptr)?;
            let pid = self.inferior.read_i32(desc + PROCDESC_PID_OFF)?;
            entries.push(ProcTableEntry { pid, hostname });
        }
        Ok(entries)
    }

    /// Job and step ids as published by SLURM-family launchers. Launchers
    /// that do not export them report as job 0 step 0.
    pub fn job_step_ids(&self) -> (u32, u32) {
        (
            self.numeric_string_symbol(SYM_JOB_ID),
            self.numeric_string_symbol(SYM_STEP_ID),
        )
    }

    fn numeric_string_symbol(&self, name: &str) -> u32 {
        self.read_string_symbol(name)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Dereference the `char *` variable `name` and read the string it
    /// points at.
    pub fn read_string_symbol(&self, name: &str) -> Result<String, OperationError> {
        let ptr = self.inferior.read_ptr(self.inferior.symbol_addr(name)?)?;
        if ptr == 0 {
            return Err(OperationError::new(format!(
                "symbol {name:?} holds a null string pointer"
            )));
        }
        self.inferior.read_cstring(ptr)
    }

    /// Release the barrier: the job starts, and the launcher runs free with
    /// no trace of the hold left behind.
    pub fn release(self) -> Result<(), OperationError> {
        self.inferior.write_i32_symbol(SYM_BEING_DEBUGGED, 0)?;
        self.inferior.detach()
    }

    /// Let go without clearing the debug flag; used when the launcher is
    /// about to be killed anyway.
    pub fn terminate(self) -> Result<(), OperationError> {
        self.inferior.detach()
    }
}
