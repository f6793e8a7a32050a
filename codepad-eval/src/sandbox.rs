//! Process-level bounds applied to every toolchain child.
//!
//! ```text
//! spawn ──► setpgid(0, 0)           own process group
//!       ──► setrlimit(AS, NPROC,    applied before exec
//!                     FSIZE, CPU)
//!
//! drop  ──► killpg(pgid, SIGKILL)   the child and everything it started
//! ```
//!
//! Filesystem and network isolation come from the wrapper argv
//! (`bwrap` by default); these bounds hold with or without it.

use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::time::Duration;

use codepad_core::SandboxViolation;

/// Kernel resource limits for a child process. `None` leaves a limit unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    /// Virtual address space
    pub address_space_bytes: Option<u64>,
    /// Processes and threads of the running user
    pub processes: Option<u64>,
    /// Largest file the program may write
    pub file_size_bytes: Option<u64>,
    /// CPU time; unset means one second past the run timeout
    pub cpu_seconds: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            address_space_bytes: Some(2 * 1024 * 1024 * 1024),
            processes: Some(1024),
            file_size_bytes: Some(16 * 1024 * 1024),
            cpu_seconds: None,
        }
    }
}

impl ResourceLimits {
    /// Limits for a run bounded by `timeout`.
    pub fn for_run(self, timeout: Duration) -> Self {
        Self {
            cpu_seconds: self
                .cpu_seconds
                .or(Some(timeout.as_secs_f64().ceil() as u64 + 1)),
            ..self
        }
    }

    /// Limits for a compile; CPU is bounded by the engine's compile timeout.
    pub fn for_compile(self) -> Self {
        Self {
            cpu_seconds: None,
            ..self
        }
    }
}

/// Which limit killed the process, if any.
pub fn violation_for(status: &ExitStatus) -> Option<SandboxViolation> {
    imp::violation_for(status)
}

pub(crate) use imp::{configure, ProcessGroup};

#[cfg(unix)]
mod imp {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::ExitStatus;

    use codepad_core::SandboxViolation;

    use super::ResourceLimits;

    /// Put the child in a fresh process group and install `limits` before exec.
    pub(crate) fn configure(command: &mut std::process::Command, limits: ResourceLimits) {
        command.process_group(0);
        // SAFETY: the hook only issues setrlimit syscalls, which are
        // async-signal-safe, and touches no memory shared with the parent.
        unsafe {
            command.pre_exec(move || apply(&limits).map_err(std::io::Error::from));
        }
    }

    fn apply(limits: &ResourceLimits) -> nix::Result<()> {
        if let Some(bytes) = limits.address_space_bytes {
            lower(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(count) = limits.processes {
            limit_processes(count)?;
        }
        if let Some(bytes) = limits.file_size_bytes {
            lower(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(secs) = limits.cpu_seconds {
            // soft limit raises SIGXCPU; the hard limit one second later is SIGKILL
            lower(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        Ok(())
    }

    /// Set a limit, never above the hard limit already in place.
    fn lower(resource: Resource, soft: u64, hard: u64) -> nix::Result<()> {
        let (_, current_hard) = getrlimit(resource)?;
        let hard = hard.min(current_hard);
        setrlimit(resource, soft.min(hard), hard)
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    fn limit_processes(count: u64) -> nix::Result<()> {
        lower(Resource::RLIMIT_NPROC, count, count)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
    fn limit_processes(_count: u64) -> nix::Result<()> {
        Ok(())
    }

    pub(crate) fn violation_for(status: &ExitStatus) -> Option<SandboxViolation> {
        let detail = match Signal::try_from(status.signal()?).ok()? {
            Signal::SIGXCPU => "CPU time",
            Signal::SIGXFSZ => "file size",
            _ => return None,
        };
        Some(SandboxViolation::ResourceLimit {
            detail: detail.to_string(),
        })
    }

    /// Kills the whole process group when dropped.
    pub(crate) struct ProcessGroup(Option<Pid>);

    impl ProcessGroup {
        /// Group led by `leader`, as set up by [`configure`].
        pub(crate) fn led_by(leader: Option<u32>) -> Self {
            Self(leader.and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw))
        }
    }

    impl Drop for ProcessGroup {
        fn drop(&mut self) {
            if let Some(pgid) = self.0.take() {
                // ESRCH: the group is already gone
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::process::ExitStatus;

    use codepad_core::SandboxViolation;

    use super::ResourceLimits;

    pub(crate) fn configure(_command: &mut std::process::Command, _limits: ResourceLimits) {}

    pub(crate) fn violation_for(_status: &ExitStatus) -> Option<SandboxViolation> {
        None
    }

    pub(crate) struct ProcessGroup;

    impl ProcessGroup {
        pub(crate) fn led_by(_leader: Option<u32>) -> Self {
            Self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_limit_derived_from_timeout() {
        let limits = ResourceLimits::default().for_run(Duration::from_millis(1500));
        assert_eq!(limits.cpu_seconds, Some(3));

        let pinned = ResourceLimits {
            cpu_seconds: Some(9),
            ..ResourceLimits::default()
        };
        assert_eq!(pinned.for_run(Duration::from_secs(1)).cpu_seconds, Some(9));
        assert_eq!(pinned.for_compile().cpu_seconds, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_limit_signals_map_to_resource_limit() {
        use std::os::unix::process::ExitStatusExt;

        let xfsz = ExitStatus::from_raw(nix::sys::signal::Signal::SIGXFSZ as i32);
        assert_eq!(
            violation_for(&xfsz),
            Some(SandboxViolation::ResourceLimit {
                detail: "file size".into()
            })
        );
        let xcpu = ExitStatus::from_raw(nix::sys::signal::Signal::SIGXCPU as i32);
        assert!(matches!(
            violation_for(&xcpu),
            Some(SandboxViolation::ResourceLimit { .. })
        ));

        // plain SIGKILL and normal exits are not limit violations
        assert_eq!(violation_for(&ExitStatus::from_raw(9)), None);
        assert_eq!(violation_for(&ExitStatus::from_raw(3 << 8)), None);
    }

    #[test]
    fn test_limits_from_toml() {
        let limits: ResourceLimits =
            toml::from_str("file_size_bytes = 1024\ncpu_seconds = 2\n").unwrap();
        assert_eq!(limits.file_size_bytes, Some(1024));
        assert_eq!(limits.cpu_seconds, Some(2));
        assert_eq!(limits.processes, Some(1024));
    }
}
