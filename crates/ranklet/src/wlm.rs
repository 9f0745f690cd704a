//! Workload-manager configuration.
//!
//! The WLM is an explicit, immutable value chosen once and threaded through
//! call sites. Detection reads the environment a single time; nothing is
//! re-probed later, and an unsupported configuration fails loudly at the
//! first use instead of guessing.

use crate::error::OperationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WlmKind {
    Slurm,
    Alps,
    Pals,
    GenericSsh,
    Localhost,
    Unsupported,
}

impl WlmKind {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "slurm" => Some(Self::Slurm),
            "alps" => Some(Self::Alps),
            "pals" => Some(Self::Pals),
            "ssh" | "generic" => Some(Self::GenericSsh),
            "localhost" => Some(Self::Localhost),
            _ => None,
        }
    }
}

/// Selects the active workload manager for this process.
pub const WLM_ENV: &str = "RANKLET_WLM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlmConfig {
    kind: WlmKind,
}

impl WlmConfig {
    pub fn new(kind: WlmKind) -> Self {
        Self { kind }
    }

    /// Build the configuration from the environment: an explicit
    /// `RANKLET_WLM` wins, otherwise the WLM is inferred from the markers
    /// the managers themselves export.
    pub fn detect() -> Self {
        if let Ok(name) = std::env::var(WLM_ENV) {
            let kind = WlmKind::from_name(&name).unwrap_or(WlmKind::Unsupported);
            tracing::debug!(?kind, source = WLM_ENV, "workload manager selected");
            return Self::new(kind);
        }

        let kind = if std::env::var_os("SLURM_CLUSTER_NAME").is_some()
            || std::env::var_os("SLURM_JOB_ID").is_some()
        {
            WlmKind::Slurm
        } else if std::env::var_os("PALS_APID").is_some() {
            WlmKind::Pals
        } else if std::env::var_os("CRAY_ALPS_APID").is_some() {
            WlmKind::Alps
        } else {
            WlmKind::GenericSsh
        };
        tracing::debug!(?kind, "workload manager detected");
        Self::new(kind)
    }

    pub fn kind(&self) -> WlmKind {
        self.kind
    }

    /// Unsupported configurations are usable as values but refuse to do
    /// work.
    pub fn ensure_supported(&self) -> Result<(), OperationError> {
        if self.kind == WlmKind::Unsupported {
            return Err(OperationError::new(
                "no supported workload manager configured",
            ));
        }
        Ok(())
    }

    /// Render the job identifier the way users of this WLM know it.
    pub fn format_job_id(&self, job_id: u32, step_id: u32) -> String {
        match self.kind {
            // SLURM job steps are named jobid.stepid.
            WlmKind::Slurm => format!("{job_id}.{step_id}"),
            _ => job_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_kinds() {
        assert_eq!(WlmKind::from_name("slurm"), Some(WlmKind::Slurm));
        assert_eq!(WlmKind::from_name("SLURM"), Some(WlmKind::Slurm));
        assert_eq!(WlmKind::from_name("ssh"), Some(WlmKind::GenericSsh));
        assert_eq!(WlmKind::from_name("mesos"), None);
    }

    #[test]
    fn slurm_job_ids_carry_the_step() {
        assert_eq!(
            WlmConfig::new(WlmKind::Slurm).format_job_id(1842, 0),
            "1842.0"
        );
        assert_eq!(
            WlmConfig::new(WlmKind::Pals).format_job_id(1842, 0),
            "1842"
        );
    }

    #[test]
    fn unsupported_fails_loudly() {
        assert!(WlmConfig::new(WlmKind::Unsupported).ensure_supported().is_err());
        assert!(WlmConfig::new(WlmKind::Localhost).ensure_supported().is_ok());
    }
}
