//! Container filesystem staging, executed entirely inside the Payload
//!
//! The sequence is a strict linear schedule: the overlay goes up, the
//! pseudo-filesystems and device nodes are populated inside it, the /etc
//! identity files are bound over, the root is swapped with `pivot_root`,
//! sensitive kernel paths are masked, and the old root is detached. Any
//! reordering either fails outright (pivot before the self bind) or
//! quietly weakens the sandbox (masking before the pivot would mask host
//! paths).

use crate::config::{RunConfig, SourceMode};
use crate::mount;
use crate::policy::LockdownPolicy;
use eyre::{eyre, Context, Result};
use nix::mount::MsFlags;
use nix::unistd::{chdir, pivot_root, sethostname};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

const HOSTNAME: &str = "otala-runc";

const DEVICE_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty", "console"];

const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("core", "/proc/kcore"),
    ("fd", "/proc/self/fd/"),
];

/// Paths under the freshly mounted /proc that become read-only
const READONLY_PROC_PATHS: &[&str] = &[
    "proc/sys",
    "proc/sysrq-trigger",
    "proc/irq",
    "proc/bus",
    "proc/asound",
    "proc/fs",
];

/// Kernel paths hidden from the workload after the pivot
const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/sys/devices/virtual/powercap",
    "/sys/firmware",
    "/sys/fs/selinux",
    "/proc/interrupts",
];

/// Run the full staging sequence and leave the process chdir'd into the
/// project directory inside the new root. Returns that directory's
/// in-container path.
pub fn stage(config: &RunConfig, policy: &LockdownPolicy, dns: Option<&str>) -> Result<PathBuf> {
    let merged = policy.merged.clone();

    for dir in [&policy.upper, &policy.work, &merged] {
        if !dir.exists() {
            fs::create_dir_all(dir).wrap_err_with(|| format!("creating {}", dir.display()))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
        }
    }

    mount::make_private("/")?;

    clear_environment();

    // Read before the pivot takes the host's /etc away.
    let host_resolv = fs::read("/etc/resolv.conf").unwrap_or_default();

    mount::mount_overlay(&policy.rootfs, &policy.upper, &policy.work, &merged)?;

    if config.network_enabled {
        fs::write(merged.join("etc/resolv.conf"), &host_resolv)
            .wrap_err("copying host resolv.conf into the overlay")?;
    }

    // pivot_root needs the new root to be a mount point of its own.
    mount::bind_self(&merged)?;

    mount_pseudo_filesystems(&merged)?;
    fix_nobody_ownership(&merged);
    enable_unprivileged_ping(&merged);
    setup_etc_files(&merged, dns)?;

    let put_old = merged.join(".pivot_old");
    fs::create_dir_all(&put_old).wrap_err("creating .pivot_old")?;
    fs::set_permissions(&put_old, fs::Permissions::from_mode(0o700))?;

    let workdir_name = config.workdir_name();
    let bind_dest = merged.join(&workdir_name);
    fs::create_dir_all(&bind_dest)
        .wrap_err_with(|| format!("creating {}", bind_dest.display()))?;
    fs::set_permissions(&bind_dest, fs::Permissions::from_mode(0o700))?;

    match config.source_mode {
        SourceMode::Bind => {
            mount::bind_mount(&config.source_path, &bind_dest, false)?;
        }
        SourceMode::Copy => {
            copy_dir_contents(&config.source_path, &bind_dest).wrap_err_with(|| {
                format!(
                    "copying {} into {}",
                    config.source_path.display(),
                    bind_dest.display()
                )
            })?;
        }
    }

    chdir(&merged).wrap_err_with(|| format!("chdir to {}", merged.display()))?;
    pivot_root(".", ".pivot_old").wrap_err("pivot_root")?;
    chdir("/").wrap_err("chdir to the new root")?;

    mask_paths()?;

    mount::unmount("/.pivot_old", true).wrap_err("detaching the old root")?;
    fs::remove_dir_all("/.pivot_old").wrap_err("removing .pivot_old")?;

    chdir(workdir_name.as_str())
        .wrap_err_with(|| format!("chdir to {}", workdir_name))?;
    std::env::set_var(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );

    Ok(PathBuf::from("/").join(workdir_name))
}

fn clear_environment() {
    let keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in keys {
        std::env::remove_var(&key);
    }
    log::debug!("Cleared process environment");
}

/// Mount proc, sys, cgroup2 and the /dev family inside the overlay.
fn mount_pseudo_filesystems(merged: &Path) -> Result<()> {
    for dir in [
        "dev",
        "dev/pts",
        "dev/mqueue",
        "dev/shm",
        "sys",
        "sys/fs/cgroup",
        "run",
        "proc",
        "tmp",
    ] {
        let path = merged.join(dir);
        if let Err(err) = fs::create_dir_all(&path) {
            log::warn!("Failed to create {}: {}", path.display(), err);
        }
    }

    mount::mount_proc(merged.join("proc"))?;
    mount::mount_sysfs(merged.join("sys"))?;
    mount::mount_cgroup2(merged.join("sys/fs/cgroup"))?;

    mount::mount_tmpfs(
        merged.join("dev"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        "mode=755,size=65536k",
    )?;

    // The tmpfs just shadowed the directories created above.
    for dir in ["dev/pts", "dev/mqueue", "dev/shm"] {
        fs::create_dir_all(merged.join(dir))
            .wrap_err_with(|| format!("creating {} after mounting /dev", dir))?;
    }

    mount::mount_devpts(merged.join("dev/pts"))?;

    let ptmx = merged.join("dev/ptmx");
    let _ = fs::remove_file(&ptmx);
    symlink("pts/ptmx", &ptmx).wrap_err("creating /dev/ptmx symlink")?;

    mount::mount_mqueue(merged.join("dev/mqueue"))?;
    mount::mount_tmpfs(
        merged.join("dev/shm"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        "size=64000k",
    )?;

    bind_device_nodes(merged)?;
    create_dev_symlinks(merged)?;
    make_proc_paths_readonly(merged)?;

    Ok(())
}

/// Bind the standard character devices from the host into the fresh /dev.
fn bind_device_nodes(merged: &Path) -> Result<()> {
    for device in DEVICE_NODES {
        let host_path = Path::new("/dev").join(device);
        let container_path = merged.join("dev").join(device);

        let host_meta = match fs::metadata(&host_path) {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!(
                    "Host device {} missing, skipping: {}",
                    host_path.display(),
                    err
                );
                continue;
            }
        };

        if container_path.exists() {
            fs::remove_file(&container_path)
                .wrap_err_with(|| format!("removing stale {}", container_path.display()))?;
        }

        // Bind targets must exist with the right shape.
        if host_meta.is_dir() {
            fs::create_dir_all(&container_path)?;
        } else {
            fs::File::create(&container_path)
                .wrap_err_with(|| format!("creating bind target {}", container_path.display()))?;
        }

        mount::bind_mount(&host_path, &container_path, false)?;
    }

    Ok(())
}

fn create_dev_symlinks(merged: &Path) -> Result<()> {
    let dev = merged.join("dev");

    for (link_name, target) in DEV_SYMLINKS {
        let link_path = dev.join(link_name);

        // A leftover symlink or file gives EEXIST; a directory stays put.
        if let Ok(meta) = fs::symlink_metadata(&link_path) {
            if meta.file_type().is_symlink() || meta.is_file() {
                if let Err(err) = fs::remove_file(&link_path) {
                    log::warn!("Failed to remove existing {}: {}", link_path.display(), err);
                    continue;
                }
            }
        }

        symlink(target, &link_path)
            .wrap_err_with(|| format!("creating symlink {} -> {}", link_path.display(), target))?;
    }

    Ok(())
}

/// Recursive-bind each sensitive /proc subtree onto itself, then lock the
/// bind read-only.
fn make_proc_paths_readonly(merged: &Path) -> Result<()> {
    for sub in READONLY_PROC_PATHS {
        let path = merged.join(sub);
        // /proc/asound only shows up with sound drivers loaded.
        if !path.exists() {
            log::debug!("Skipping read-only remount of absent {}", path.display());
            continue;
        }

        mount::bind_self(&path)?;
        mount::remount_ro_locked(&path)?;
    }

    Ok(())
}

/// Allow ping without privileges. Expected to fail rootless; ignored.
fn enable_unprivileged_ping(merged: &Path) {
    let path = merged.join("proc/sys/net/ipv4/ping_group_range");
    if let Err(err) = fs::write(&path, "0 0") {
        log::debug!("Could not set ping_group_range (expected rootless): {}", err);
    }
}

/// The base image may carry files owned by the overflow id (65534) that the
/// mapped user cannot use. Best-effort chown to ourselves.
fn fix_nobody_ownership(merged: &Path) {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();

    for sub in ["usr/share/applications"] {
        let root = merged.join(sub);
        if !root.exists() {
            continue;
        }
        chown_overflow_owned(&root, uid, gid);
    }
}

fn chown_overflow_owned(path: &Path, uid: nix::unistd::Uid, gid: nix::unistd::Gid) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };

    if meta.uid() == 65534 || meta.gid() == 65534 {
        if let Err(err) = nix::unistd::chown(path, Some(uid), Some(gid)) {
            log::warn!("Could not chown {}: {}", path.display(), err);
        }
    }

    if meta.is_dir() {
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            chown_overflow_owned(&entry.path(), uid, gid);
        }
    }
}

/// Bind small writable files over /etc/{hosts,hostname,resolv.conf} from a
/// private tmpfs, so the overlay's own file identity is preserved while the
/// contents stay adjustable.
fn setup_etc_files(merged: &Path, dns: Option<&str>) -> Result<()> {
    sethostname(HOSTNAME).wrap_err("setting container hostname")?;

    let base = merged.join("tmp/tmpfs-etc");
    fs::create_dir_all(&base).wrap_err("creating tmpfs-etc")?;
    fs::set_permissions(&base, fs::Permissions::from_mode(0o700))?;
    mount::mount_tmpfs(
        &base,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        "size=64k,mode=700",
    )?;

    let mut names = vec!["hosts", "hostname"];
    if dns.is_some() {
        names.push("resolv.conf");
    }

    let etc = merged.join("etc");
    fs::create_dir_all(&etc)?;

    for name in &names {
        let backing = base.join(name);
        fs::File::create(&backing)
            .wrap_err_with(|| format!("creating {}", backing.display()))?;

        let target = etc.join(name);
        if !target.exists() {
            fs::File::create(&target)
                .wrap_err_with(|| format!("creating {}", target.display()))?;
        }

        mount::bind_mount(&backing, &target, false)?;
    }

    fs::write(etc.join("hosts"), hosts_file_contents()).wrap_err("writing /etc/hosts")?;
    fs::write(etc.join("hostname"), format!("{}\n", HOSTNAME)).wrap_err("writing /etc/hostname")?;

    if let Some(dns) = dns {
        fs::write(etc.join("resolv.conf"), resolv_conf_contents(dns))
            .wrap_err("writing /etc/resolv.conf")?;
    }

    Ok(())
}

fn hosts_file_contents() -> String {
    format!("127.0.0.1 localhost\n127.0.0.1 {}\n", HOSTNAME)
}

/// The pasta-forwarded resolver first, public resolvers after it.
fn resolv_conf_contents(dns: &str) -> String {
    format!(
        "nameserver {}\n\
         nameserver 8.8.8.8\n\
         nameserver 1.1.1.1\n\
         nameserver 2001:4860:4860::8888\n\
         nameserver 2001:4860:4860::8844\n",
        dns
    )
}

/// Hide sensitive kernel paths: directories get an empty read-only tmpfs,
/// files get /dev/null bound over them. Runs after the pivot, against the
/// container's own /proc and /sys.
fn mask_paths() -> Result<()> {
    let mut paths: Vec<PathBuf> = MASKED_PATHS.iter().map(PathBuf::from).collect();
    paths.extend(cpu_thermal_throttle_paths()?);

    for path in paths {
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            // Only existing paths need masking.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(eyre!("stat {}: {}", path.display(), err)),
        };

        if meta.is_dir() {
            mount::mount_tmpfs(
                &path,
                MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                "mode=755,size=0",
            )
            .wrap_err_with(|| format!("masking directory {}", path.display()))?;
        } else {
            mount::bind_mount("/dev/null", &path, true)
                .wrap_err_with(|| format!("masking file {}", path.display()))?;
        }
    }

    Ok(())
}

/// Per-CPU thermal_throttle directories, discovered dynamically.
fn cpu_thermal_throttle_paths() -> Result<Vec<PathBuf>> {
    let cpu_dir = Path::new("/sys/devices/system/cpu");
    let entries = fs::read_dir(cpu_dir)
        .wrap_err_with(|| format!("reading {}", cpu_dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let Some(number) = name.strip_prefix("cpu") else {
            continue;
        };
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let throttle = entry.path().join("thermal_throttle");
        if throttle.exists() {
            paths.push(throttle);
        }
    }

    Ok(paths)
}

/// Copy the contents of `src` into `dst`, preserving modes and symlinks.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).wrap_err_with(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let source = entry.path();
        let target = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&source)?;

        if meta.file_type().is_symlink() {
            let link = fs::read_link(&source)?;
            symlink(&link, &target)
                .wrap_err_with(|| format!("copying symlink {}", source.display()))?;
        } else if meta.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, meta.permissions())?;
            copy_dir_contents(&source, &target)?;
        } else {
            fs::copy(&source, &target)
                .wrap_err_with(|| format!("copying {}", source.display()))?;
        }
    }

    Ok(())
}
