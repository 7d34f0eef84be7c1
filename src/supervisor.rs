//! Supervisor: the parent half of the bring-up
//!
//! Owns the container identity, the cgroup scope, the on-disk layout, the
//! clone of the Payload into its seven fresh namespaces, the parent side of
//! the handshake, and the cleanup that runs no matter how the container
//! ends.

use crate::config::RunConfig;
use crate::identity;
use crate::idmap;
use crate::layout::{self, ContainerPaths};
use crate::message::{ParentPipe, PAYLOAD_RX_FD, PAYLOAD_TX_FD};
use crate::network;
use crate::policy::LockdownPolicy;
use crate::scope::{self, ScopeStart};
use eyre::{bail, eyre, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs::File;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

/// Run a container to completion and return its exit code.
pub fn run(mut config: RunConfig) -> Result<i32> {
    // One retry with a fresh identity when the scope collides: the on-disk
    // id came from a run that crashed without stopping its scope.
    for attempt in 0..2 {
        let (id, existed) = if attempt == 0 {
            identity::resolve(&config.source_path)?
        } else {
            (identity::regenerate(&config.source_path)?, false)
        };
        config.container_id = id;
        log::info!(
            "Container {} ({}, memory limit {} MiB)",
            config.container_name(),
            if existed { "existing" } else { "new" },
            config.memory_limit_mib
        );

        match scope::start(&config.container_name(), config.memory_limit_bytes())? {
            ScopeStart::Created => return bring_up(&config),
            ScopeStart::AlreadyExists => {
                log::warn!(
                    "Scope for {} already exists, retrying with a fresh identity",
                    config.container_name()
                );
                continue;
            }
        }
    }

    bail!("scope collision persisted after an identity retry");
}

fn bring_up(config: &RunConfig) -> Result<i32> {
    let (paths, document) = layout::prepare(
        &config.container_id,
        crate::CONFIG_TEMPLATE,
        crate::ROOTFS_ARCHIVE,
    )?;
    let policy = LockdownPolicy::from_slice(&document)?;

    let (child, mut pipe) = spawn_payload()?;
    log::debug!("Payload spawned with pid {}", child);

    let handshake = run_handshake(config, &policy, child, &mut pipe);
    drop(pipe);

    if let Err(err) = handshake {
        clean(config, &paths, child);
        return Err(err.wrap_err("handshake with the payload failed"));
    }

    install_signal_handler()?;

    let code = await_child(config, &paths, child)?;
    clean(config, &paths, child);

    if code == 0 {
        log::info!("Container exited successfully");
    } else {
        log::warn!("Container exited with status {}", code);
    }
    Ok(code)
}

/// Drive the parent side of the handshake in its fixed order.
fn run_handshake(
    config: &RunConfig,
    policy: &LockdownPolicy,
    child: Pid,
    pipe: &mut ParentPipe,
) -> Result<()> {
    pipe.send_ready()?;
    pipe.wait_ok()?;

    // The child is blocked on the mapping record; its pid is stable.
    idmap::apply(child).wrap_err("applying uid/gid maps")?;
    pipe.send_mapping(config)?;
    pipe.wait_mapping_ok()?;

    // Repeated payload: the child re-exec'd between "ok" and "mapping-ok"
    // and keeps only what it reads after that point.
    pipe.send_configuration(config)?;

    if config.network_enabled {
        let params = network::configure(child).wrap_err("configuring user-mode networking")?;
        pipe.send_network(&params)?;
    }

    pipe.send_security(policy)?;
    Ok(())
}

/// Clone the Payload into the full namespace set with the handshake pipes
/// bound to fds 3 and 4, re-executing this binary with the child sentinel.
fn spawn_payload() -> Result<(Pid, ParentPipe)> {
    // parent → child records, and child → parent replies
    let (child_rx, parent_tx) = nix::unistd::pipe().wrap_err("creating parent→child pipe")?;
    let (parent_rx, child_tx) = nix::unistd::pipe().wrap_err("creating child→parent pipe")?;

    let flags = (libc::CLONE_NEWUSER
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWCGROUP
        | libc::CLONE_NEWNET) as u64;

    let args = CloneArgs {
        flags,
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };

    // SAFETY: clone3 forks this process; the child branch only calls
    // async-signal-safe functions (dup2, close, execv, _exit).
    let pid = unsafe { clone3(&args) }?;

    if pid == 0 {
        // The child must not keep copies of the parent's pipe ends, or
        // neither side ever observes EOF when the other dies.
        unsafe {
            libc::close(parent_tx.as_raw_fd());
            libc::close(parent_rx.as_raw_fd());
        }
        let code = child_exec(child_rx.as_raw_fd(), child_tx.as_raw_fd());
        // Only reached when execv failed.
        unsafe { libc::_exit(code) };
    }

    drop(child_rx);
    drop(child_tx);

    let pipe = ParentPipe::new(owned_into_file(parent_tx), owned_into_file(parent_rx));
    Ok((Pid::from_raw(pid), pipe))
}

fn owned_into_file(fd: OwnedFd) -> File {
    // SAFETY: transfers sole ownership of the descriptor.
    unsafe { File::from_raw_fd(fd.into_raw_fd()) }
}

/// clone3 argument block (linux/sched.h)
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Fork-style clone3: no new stack, the child continues right here.
unsafe fn clone3(args: &CloneArgs) -> Result<libc::pid_t> {
    let ret = libc::syscall(
        libc::SYS_clone3,
        args as *const CloneArgs,
        std::mem::size_of::<CloneArgs>(),
    );

    if ret == -1 {
        return Err(eyre!(
            "clone3 failed: {}",
            std::io::Error::last_os_error()
        ));
    }

    Ok(ret as libc::pid_t)
}

/// Child branch after clone3: rebind the pipe ends to the well-known fds
/// and become the Payload. Must stay async-signal-safe.
fn child_exec(rx: libc::c_int, tx: libc::c_int) -> i32 {
    unsafe {
        // Get both ends out of the target fd range before rebinding, in
        // case pipe() handed us 3 or 4 directly.
        let high_rx = libc::fcntl(rx, libc::F_DUPFD, 10);
        let high_tx = libc::fcntl(tx, libc::F_DUPFD, 10);
        if high_rx < 0 || high_tx < 0 {
            return 127;
        }
        libc::close(rx);
        libc::close(tx);

        if libc::dup2(high_rx, PAYLOAD_RX_FD) < 0 || libc::dup2(high_tx, PAYLOAD_TX_FD) < 0 {
            return 127;
        }
        libc::close(high_rx);
        libc::close(high_tx);

        let exe = c"/proc/self/exe";
        let arg0 = c"otala-runc";
        let arg1 = c"child";
        let argv = [arg0.as_ptr(), arg1.as_ptr(), std::ptr::null()];
        libc::execv(exe.as_ptr(), argv.as_ptr());
    }

    127
}

fn install_signal_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic flag.
        unsafe { sigaction(signal, &action) }
            .wrap_err_with(|| format!("installing {} handler", signal))?;
    }

    Ok(())
}

/// Wait for the Payload, honoring termination signals: the wait is
/// interrupted, cleanup runs, and the Supervisor exits non-zero.
fn await_child(config: &RunConfig, paths: &ContainerPaths, child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => {
                if TERMINATED.load(Ordering::SeqCst) {
                    log::warn!("Received termination signal, shutting down container");
                    clean(config, paths, child);
                    std::process::exit(1);
                }
            }
            Err(err) => return Err(err).wrap_err("waiting for the payload"),
        }
    }
}

/// Unconditional cleanup: per-container directories (when configured),
/// descendant reaping, scope teardown, and a final SIGKILL for the child.
/// Every step tolerates already-clean state so running it twice is safe.
fn clean(config: &RunConfig, paths: &ContainerPaths, child: Pid) {
    if config.delete_on_exit {
        for path in [&paths.config_dir, &paths.storage] {
            match std::fs::remove_dir_all(path) {
                Ok(()) => log::info!("Deleted {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("Failed to delete {}: {}", path.display(), err),
            }
        }
    }

    log::debug!("Reaping descendants");
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                log::debug!("Reaped pid {}", pid);
                reaped += 1;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    log::debug!("Reaper finished, collected {} descendants", reaped);

    scope::stop(&config.container_name());

    // The child is normally gone by now; this covers a hung payload.
    match kill(child, Signal::SIGKILL) {
        Ok(()) => log::debug!("Sent SIGKILL to pid {}", child),
        Err(Errno::ESRCH) => {}
        Err(err) => log::warn!("Failed to kill pid {}: {}", child, err),
    }
}
