//! Mount-table teardown
//!
//! Best-effort unmounting of everything visible in the calling process's
//! mount namespace, deepest paths first so nested mounts come apart in the
//! right order. Used by the Payload's signal path; failures are logged and
//! skipped because the Supervisor's cleanup compensates.

use eyre::{Context, Result};
use std::fs;

/// Detach-unmount every mount below `/`, deepest first.
pub fn unmount_all() {
    let mounts = match list_mounts() {
        Ok(mounts) => mounts,
        Err(err) => {
            log::warn!("Failed to list mounts: {:#}", err);
            return;
        }
    };

    for path in deepest_first(mounts) {
        match crate::mount::unmount(&path, true) {
            Ok(()) => log::debug!("Unmounted {}", path),
            Err(err) => log::warn!("Failed to unmount {}: {:#}", path, err),
        }
    }
}

/// Mount points of the current process, from `/proc/self/mountinfo`.
pub fn list_mounts() -> Result<Vec<String>> {
    let contents =
        fs::read_to_string("/proc/self/mountinfo").wrap_err("reading /proc/self/mountinfo")?;
    Ok(parse_mountinfo(&contents))
}

/// Field 4 of each mountinfo line is the mount point.
fn parse_mountinfo(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(str::to_string)
        .collect()
}

/// Keep everything under `/` except the root itself, longest path first.
fn deepest_first(mounts: Vec<String>) -> Vec<String> {
    let mut subs: Vec<String> = mounts
        .into_iter()
        .filter(|m| m != "/" && m.starts_with('/'))
        .collect();
    subs.sort_by_key(|m| std::cmp::Reverse(m.len()));
    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mountinfo_extracts_mount_points() {
        let sample = "\
22 27 0:21 / /proc rw,nosuid,nodev,noexec shared:5 - proc proc rw
23 27 0:22 / /sys rw,nosuid shared:6 - sysfs sysfs rw
27 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
";
        let mounts = parse_mountinfo(sample);
        assert_eq!(mounts, vec!["/proc", "/sys", "/"]);
    }

    #[test]
    fn test_deepest_first_ordering() {
        let mounts = vec![
            "/".to_string(),
            "/dev".to_string(),
            "/dev/pts".to_string(),
            "/proc".to_string(),
            "/sys/fs/cgroup".to_string(),
            "/sys".to_string(),
        ];

        let ordered = deepest_first(mounts);

        // Root is dropped, and no mount comes before one nested inside it.
        assert!(!ordered.contains(&"/".to_string()));
        let pts = ordered.iter().position(|m| m == "/dev/pts").unwrap();
        let dev = ordered.iter().position(|m| m == "/dev").unwrap();
        assert!(pts < dev);
        let cgroup = ordered.iter().position(|m| m == "/sys/fs/cgroup").unwrap();
        let sys = ordered.iter().position(|m| m == "/sys").unwrap();
        assert!(cgroup < sys);
    }

    #[test]
    fn test_list_mounts_on_this_system() -> Result<()> {
        let mounts = list_mounts()?;
        assert!(mounts.iter().any(|m| m == "/"));
        Ok(())
    }
}
