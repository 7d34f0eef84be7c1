//! Capability acquisition via self re-exec
//!
//! Writing the uid/gid maps does not retroactively grant the already-running
//! Payload its in-namespace capabilities; the kernel confers them at the
//! next `execve`. The Payload therefore replaces itself with a fresh image
//! of the same binary once the Supervisor confirms the maps.
//!
//! A retry counter rides in the environment under a name qualified by the
//! pid-namespace inode and pid, so a kernel state that never yields
//! capabilities cannot loop forever: backoff after five attempts, abort
//! after ten.

use eyre::{bail, eyre, Context, Result};
use nix::unistd::execv;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::time::Duration;

const MAX_RETRIES: u32 = 10;
const BACKOFF_AFTER: u32 = 5;
const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Re-execute the current binary with the same arguments and environment.
/// On success this never returns.
pub fn reexec_self() -> Result<Infallible> {
    let variable = counter_variable();
    let count = current_count(&variable)?;

    if count > MAX_RETRIES {
        bail!(
            "failed to gain capabilities after {} retries ({}={})",
            MAX_RETRIES,
            variable,
            count
        );
    }

    if count > BACKOFF_AFTER {
        let delay = BACKOFF_STEP * count;
        log::warn!("Applying re-exec backoff of {:?} (retry {})", delay, count);
        std::thread::sleep(delay);
    }

    std::env::set_var(&variable, (count + 1).to_string());
    log::debug!("Re-executing via /proc/self/exe ({}={})", variable, count + 1);

    let exe = CString::new("/proc/self/exe")?;
    let args = std::env::args()
        .map(CString::new)
        .collect::<std::result::Result<Vec<_>, _>>()
        .wrap_err("argv contains an interior NUL")?;

    execv(&exe, &args).wrap_err("re-executing /proc/self/exe")?;
    unreachable!("execv returned without an error");
}

/// Environment variable name qualified by pid-namespace inode and pid, so
/// counters from unrelated namespaces cannot collide.
fn counter_variable() -> String {
    let pid = std::process::id();
    let ns = pid_namespace_inode(pid).unwrap_or(0);
    format!("_OTALARUNC_REXEC-COUNT_{}_{}", ns, pid)
}

fn pid_namespace_inode(pid: u32) -> Option<u64> {
    std::fs::metadata(format!("/proc/{}/ns/pid", pid))
        .ok()
        .map(|m| m.ino())
}

fn current_count(variable: &str) -> Result<u32> {
    match std::env::var(variable) {
        Ok(value) => value
            .parse::<u32>()
            .map_err(|e| eyre!("invalid retry count {:?} in {}: {}", value, variable, e)),
        Err(_) => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_variable_shape() {
        let variable = counter_variable();
        assert!(variable.starts_with("_OTALARUNC_REXEC-COUNT_"));
        assert!(variable.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_current_count_defaults_to_zero() -> Result<()> {
        assert_eq!(current_count("_OTALARUNC_TEST_UNSET_VARIABLE")?, 0);
        Ok(())
    }

    #[test]
    fn test_current_count_parses_value() -> Result<()> {
        std::env::set_var("_OTALARUNC_TEST_COUNT", "7");
        assert_eq!(current_count("_OTALARUNC_TEST_COUNT")?, 7);
        std::env::remove_var("_OTALARUNC_TEST_COUNT");
        Ok(())
    }

    #[test]
    fn test_current_count_rejects_garbage() {
        std::env::set_var("_OTALARUNC_TEST_BAD_COUNT", "not-a-number");
        assert!(current_count("_OTALARUNC_TEST_BAD_COUNT").is_err());
        std::env::remove_var("_OTALARUNC_TEST_BAD_COUNT");
    }

    #[test]
    fn test_pid_namespace_inode_for_self() {
        // /proc is available on any Linux test machine.
        assert!(pid_namespace_inode(std::process::id()).is_some());
    }
}
