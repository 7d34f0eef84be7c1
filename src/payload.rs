//! Payload: the child half of the bring-up
//!
//! Entered when the binary is re-executed with the "child" sentinel. The
//! process is already inside the fresh namespace set but owns no
//! capabilities until the Supervisor writes the uid/gid maps; acquiring
//! them takes one more self-exec. After the handshake delivers the
//! configuration, the Payload stages the filesystem, locks itself down and
//! becomes the workload.

use crate::capabilities;
use crate::cleanup;
use crate::config::Workload;
use crate::limits;
use crate::message::ChildPipe;
use crate::reexec;
use crate::rootfs;
use crate::seccomp;
use crate::workload;
use eyre::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

/// Run the child side of the bring-up. Only returns on error; success ends
/// in `execve`.
pub fn run() -> Result<()> {
    install_signal_handler()?;

    // SAFETY: the Supervisor bound the handshake pipes to fds 3 and 4
    // before exec, and nothing else in this process has touched them.
    let mut pipe = unsafe { ChildPipe::from_inherited_fds() };

    if !capabilities::has_effective_caps()? {
        // Pre-mapping path: let the Supervisor know we are alive, wait for
        // the id maps, then re-exec to pick up the capabilities the new
        // mapping grants. "ok" goes out before the exec so the Supervisor
        // sees exactly one per bring-up.
        interruptible(|| pipe.wait_ready())?;
        pipe.send_ok()?;
        interruptible(|| pipe.wait_mapping().map(|_| ()))?;

        reexec::reexec_self()?;
        unreachable!("re-exec returned");
    }

    // Post-re-exec path: confirm the mapping and collect the run bundle.
    pipe.send_mapping_ok()?;
    let config = interruptible(|| pipe.wait_configuration())?;

    let dns = if config.network_enabled {
        let params = interruptible(|| pipe.wait_network())?;
        log::debug!("Network configured on {} ({})", params.dev, params.address);
        Some(params.dns)
    } else {
        None
    };

    let policy = interruptible(|| pipe.wait_security())?;

    // No further parent communication; both endpoints close here.
    drop(pipe);

    let workdir = rootfs::stage(&config, &policy, dns.as_deref())
        .wrap_err("staging the container filesystem")?;
    log::debug!("Filesystem staged, project directory at {}", workdir.display());

    if let Workload::Script { language, .. } = &config.workload {
        if let Some(installer) = workload::installer_for(*language, &workdir) {
            workload::install_dependencies(&installer, &workdir)
                .wrap_err("installing workload dependencies")?;
        }
    }

    let argv = workload::assemble_argv(&config.workload)?;
    let env = workload::container_env(&workdir.display().to_string());

    limits::apply(&policy.rlimits).wrap_err("applying resource limits")?;
    capabilities::apply(&policy.capabilities).wrap_err("applying capabilities")?;

    log::info!("Executing workload: {:?}", argv);

    // Seccomp load is last; logging or allocation after it may already
    // trip the filter.
    seccomp::apply(&policy.seccomp).wrap_err("applying seccomp policy")?;

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).env_clear().envs(env);

    // exec replaces the image; reaching the return is the failure case.
    let err = command.exec();
    Err(err).wrap_err_with(|| format!("executing workload {:?}", argv[0]))
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

/// Run a blocking pipe step; if it fails because a termination signal
/// arrived, unwind the mount table and exit cleanly instead.
fn interruptible<T>(mut step: impl FnMut() -> Result<T>) -> Result<T> {
    match step() {
        Ok(value) => Ok(value),
        Err(err) => {
            if TERMINATED.load(Ordering::SeqCst) {
                log::warn!("Termination signal received, cleaning up container mounts");
                cleanup::unmount_all();
                std::process::exit(0);
            }
            Err(err)
        }
    }
}
