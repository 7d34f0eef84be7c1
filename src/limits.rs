//! Resource limits from the lockdown document

use crate::policy::Rlimit;
use eyre::{Context, Result};
use nix::sys::resource::{setrlimit, Resource};

/// Apply every recognized rlimit. Unknown resource names are skipped, the
/// same way unknown capability and syscall names are.
pub fn apply(rlimits: &[Rlimit]) -> Result<()> {
    for rlimit in rlimits {
        let Some(resource) = resource_from_name(&rlimit.kind) else {
            log::debug!("Skipping unknown rlimit {:?}", rlimit.kind);
            continue;
        };

        setrlimit(resource, rlimit.soft, rlimit.hard)
            .wrap_err_with(|| format!("setting {} to {}/{}", rlimit.kind, rlimit.soft, rlimit.hard))?;
        log::debug!("Set {} = {}/{}", rlimit.kind, rlimit.soft, rlimit.hard);
    }

    Ok(())
}

fn resource_from_name(name: &str) -> Option<Resource> {
    match name {
        "RLIMIT_AS" => Some(Resource::RLIMIT_AS),
        "RLIMIT_CORE" => Some(Resource::RLIMIT_CORE),
        "RLIMIT_CPU" => Some(Resource::RLIMIT_CPU),
        "RLIMIT_DATA" => Some(Resource::RLIMIT_DATA),
        "RLIMIT_FSIZE" => Some(Resource::RLIMIT_FSIZE),
        "RLIMIT_LOCKS" => Some(Resource::RLIMIT_LOCKS),
        "RLIMIT_MEMLOCK" => Some(Resource::RLIMIT_MEMLOCK),
        "RLIMIT_MSGQUEUE" => Some(Resource::RLIMIT_MSGQUEUE),
        "RLIMIT_NICE" => Some(Resource::RLIMIT_NICE),
        "RLIMIT_NOFILE" => Some(Resource::RLIMIT_NOFILE),
        "RLIMIT_NPROC" => Some(Resource::RLIMIT_NPROC),
        "RLIMIT_RTPRIO" => Some(Resource::RLIMIT_RTPRIO),
        "RLIMIT_RTTIME" => Some(Resource::RLIMIT_RTTIME),
        "RLIMIT_SIGPENDING" => Some(Resource::RLIMIT_SIGPENDING),
        "RLIMIT_STACK" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}
