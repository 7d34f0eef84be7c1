//! Filesystem mount operations
//!
//! Thin wrappers around `mount(2)`/`umount2(2)` with the exact flag and
//! option combinations the container bring-up needs. The ordering logic
//! lives in [`crate::rootfs`]; these helpers are order-free.

use eyre::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::Path;

/// Mount the overlay union at `merged`.
///
/// `userxattr` keeps the overlay usable from an unprivileged user namespace.
pub fn mount_overlay(lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    let options = overlay_options(lower, upper, work);

    log::debug!("Mounting overlay at {} ({})", merged.display(), options);
    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .wrap_err_with(|| format!("Failed to mount overlay on {}", merged.display()))?;

    Ok(())
}

fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={},userxattr",
        lower.display(),
        upper.display(),
        work.display()
    )
}

/// Mount proc with the standard hardening flags
pub fn mount_proc<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Mounting proc at {}", target.as_ref().display());
    mount(
        Some("proc"),
        target.as_ref(),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
        None::<&str>,
    )
    .wrap_err_with(|| format!("Failed to mount proc on {}", target.as_ref().display()))?;

    Ok(())
}

/// Mount sysfs read-only
pub fn mount_sysfs<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Mounting sysfs at {}", target.as_ref().display());
    mount(
        Some("sysfs"),
        target.as_ref(),
        Some("sysfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .wrap_err_with(|| format!("Failed to mount sysfs on {}", target.as_ref().display()))?;

    Ok(())
}

/// Mount the cgroup2 hierarchy read-only with delegation options
pub fn mount_cgroup2<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Mounting cgroup2 at {}", target.as_ref().display());
    mount(
        Some("cgroup2"),
        target.as_ref(),
        Some("cgroup2"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        Some("nsdelegate,memory_recursiveprot"),
    )
    .wrap_err_with(|| format!("Failed to mount cgroup2 on {}", target.as_ref().display()))?;

    Ok(())
}

/// Mount a tmpfs with explicit flags and options
pub fn mount_tmpfs<P: AsRef<Path>>(target: P, flags: MsFlags, options: &str) -> Result<()> {
    log::debug!(
        "Mounting tmpfs at {} with options: {}",
        target.as_ref().display(),
        options
    );
    mount(
        Some("tmpfs"),
        target.as_ref(),
        Some("tmpfs"),
        flags,
        Some(options),
    )
    .wrap_err_with(|| format!("Failed to mount tmpfs on {}", target.as_ref().display()))?;

    Ok(())
}

/// Mount a fresh devpts instance
pub fn mount_devpts<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Mounting devpts at {}", target.as_ref().display());
    mount(
        Some("devpts"),
        target.as_ref(),
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
    )
    .wrap_err_with(|| format!("Failed to mount devpts on {}", target.as_ref().display()))?;

    Ok(())
}

/// Mount the POSIX message queue filesystem
pub fn mount_mqueue<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Mounting mqueue at {}", target.as_ref().display());
    mount(
        Some("mqueue"),
        target.as_ref(),
        Some("mqueue"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .wrap_err_with(|| format!("Failed to mount mqueue on {}", target.as_ref().display()))?;

    Ok(())
}

/// Bind mount `source` onto `dest`
pub fn bind_mount<P: AsRef<Path>, Q: AsRef<Path>>(
    source: P,
    dest: Q,
    recursive: bool,
) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }

    log::debug!(
        "Bind mounting {} onto {}",
        source.as_ref().display(),
        dest.as_ref().display()
    );
    mount(
        Some(source.as_ref()),
        dest.as_ref(),
        None::<&str>,
        flags,
        None::<&str>,
    )
    .wrap_err_with(|| {
        format!(
            "Failed to bind mount {} onto {}",
            source.as_ref().display(),
            dest.as_ref().display()
        )
    })?;

    Ok(())
}

/// Bind a mount point onto itself so `pivot_root` sees it as a distinct mount
pub fn bind_self<P: AsRef<Path>>(target: P) -> Result<()> {
    bind_mount(target.as_ref(), target.as_ref(), true)
}

/// Remount an existing mount read-only with the hardening flags
pub fn remount_ro_locked<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Remounting {} read-only", target.as_ref().display());
    mount(
        None::<&str>,
        target.as_ref(),
        None::<&str>,
        MsFlags::MS_REMOUNT
            | MsFlags::MS_RDONLY
            | MsFlags::MS_NOSUID
            | MsFlags::MS_NODEV
            | MsFlags::MS_NOEXEC
            | MsFlags::MS_RELATIME,
        None::<&str>,
    )
    .wrap_err_with(|| {
        format!(
            "Failed to remount {} as read-only",
            target.as_ref().display()
        )
    })?;

    Ok(())
}

/// Make mount propagation private recursively, so nothing the Payload does
/// leaks back into the host mount namespace
pub fn make_private<P: AsRef<Path>>(target: P) -> Result<()> {
    log::debug!("Making {} private", target.as_ref().display());
    mount(
        None::<&str>,
        target.as_ref(),
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .wrap_err_with(|| format!("Failed to make {} private", target.as_ref().display()))?;

    Ok(())
}

/// Unmount, optionally with a lazy detach
pub fn unmount<P: AsRef<Path>>(target: P, detach: bool) -> Result<()> {
    let flags = if detach {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };

    umount2(target.as_ref(), flags)
        .wrap_err_with(|| format!("Failed to unmount {}", target.as_ref().display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overlay_option_formatting() {
        let options = overlay_options(
            Path::new("/d/rootfs/alpine"),
            Path::new("/d/storage/x/upper"),
            Path::new("/d/storage/x/work"),
        );
        assert_eq!(
            options,
            "lowerdir=/d/rootfs/alpine,upperdir=/d/storage/x/upper,workdir=/d/storage/x/work,userxattr"
        );
    }

    #[test]
    fn test_mount_proc_nonexistent_target() {
        assert!(mount_proc("/nonexistent/proc/mount/point").is_err());
    }

    #[test]
    fn test_mount_proc_needs_privileges() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("proc");
        std::fs::create_dir(&target).unwrap();

        // Outside a fresh namespace set this fails with EPERM unless root.
        if nix::unistd::getuid().as_raw() != 0 {
            assert!(mount_proc(&target).is_err());
        }
    }

    #[test]
    fn test_mount_tmpfs_nonexistent_target() {
        assert!(mount_tmpfs(
            "/nonexistent/tmpfs/mount/point",
            MsFlags::MS_NOSUID,
            "mode=755"
        )
        .is_err());
    }

    #[test]
    fn test_bind_mount_nonexistent_source() {
        let tmp = TempDir::new().unwrap();
        assert!(bind_mount("/nonexistent/source", tmp.path(), true).is_err());
    }

    #[test]
    fn test_unmount_not_mounted() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("notmounted");
        std::fs::create_dir(&target).unwrap();

        assert!(unmount(&target, false).is_err());
        assert!(unmount(&target, true).is_err());
    }

    #[test]
    fn test_make_private_not_mounted() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("notmounted");
        std::fs::create_dir(&target).unwrap();

        assert!(make_private(&target).is_err());
    }
}
