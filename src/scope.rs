//! Transient cgroup scope through the session service manager
//!
//! The Supervisor parks itself (and therefore the whole container process
//! tree) inside a `<name>.scope` unit on the user session bus, carrying the
//! memory limits. An already-existing unit for this identity means a stale
//! identity file from a crashed run; the caller retries once with a fresh id.

use eyre::{Context, Result};
use std::time::Duration;
use zbus::blocking::Connection;
use zbus::zvariant::Value;

const SYSTEMD_DEST: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_IFACE: &str = "org.freedesktop.systemd1.Manager";

/// Outcome of a scope start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStart {
    Created,
    /// A unit with this name is already loaded; bring-up must retry with a
    /// new identity
    AlreadyExists,
}

/// Create `<container_name>.scope` with the memory limits applied and the
/// current process as its first member.
pub fn start(container_name: &str, memory_bytes: u64) -> Result<ScopeStart> {
    let connection = Connection::session().wrap_err("connecting to the session bus")?;
    let unit = unit_name(container_name);

    // GetUnit only answers for loaded units, so success means collision.
    let existing = connection.call_method(
        Some(SYSTEMD_DEST),
        SYSTEMD_PATH,
        Some(SYSTEMD_IFACE),
        "GetUnit",
        &(unit.as_str(),),
    );
    if existing.is_ok() {
        log::warn!("Scope unit {} already exists", unit);
        return Ok(ScopeStart::AlreadyExists);
    }

    let pid = std::process::id();
    let properties: Vec<(&str, Value)> = vec![
        ("MemoryMax", Value::U64(memory_bytes)),
        ("MemorySwapMax", Value::U64(memory_bytes)),
        ("PIDs", Value::from(vec![pid])),
    ];
    let aux: Vec<(&str, Vec<(&str, Value)>)> = Vec::new();

    connection
        .call_method(
            Some(SYSTEMD_DEST),
            SYSTEMD_PATH,
            Some(SYSTEMD_IFACE),
            "StartTransientUnit",
            &(unit.as_str(), "replace", properties, aux),
        )
        .wrap_err_with(|| format!("starting transient unit {}", unit))?;

    // Give the manager a moment to materialize the cgroup before anyone
    // inspects it.
    std::thread::sleep(Duration::from_millis(500));
    verify_memory_max(memory_bytes);

    log::info!(
        "Scope {} created (MemoryMax={} bytes)",
        unit,
        memory_bytes
    );
    Ok(ScopeStart::Created)
}

/// Stop the scope and clear any failed state. Best-effort: the unit may
/// already be gone when the container exited cleanly.
pub fn stop(container_name: &str) {
    let unit = unit_name(container_name);

    let connection = match Connection::session() {
        Ok(connection) => connection,
        Err(err) => {
            log::warn!("Session bus unavailable during cleanup: {}", err);
            return;
        }
    };

    match connection.call_method(
        Some(SYSTEMD_DEST),
        SYSTEMD_PATH,
        Some(SYSTEMD_IFACE),
        "StopUnit",
        &(unit.as_str(), "replace"),
    ) {
        Ok(_) => log::debug!("Stopped scope {}", unit),
        Err(err) => log::debug!("StopUnit {} failed (may be gone): {}", unit, err),
    }

    if let Err(err) = connection.call_method(
        Some(SYSTEMD_DEST),
        SYSTEMD_PATH,
        Some(SYSTEMD_IFACE),
        "ResetFailedUnit",
        &(unit.as_str(),),
    ) {
        log::debug!("ResetFailedUnit {} failed (not in failed state): {}", unit, err);
    }
}

fn unit_name(container_name: &str) -> String {
    format!("{}.scope", container_name)
}

/// Read back memory.max from our own cgroup and compare. Verification only;
/// a mismatch is logged, not fatal.
fn verify_memory_max(expected: u64) {
    let cgroup = match std::fs::read_to_string("/proc/self/cgroup") {
        Ok(contents) => contents,
        Err(err) => {
            log::debug!("Could not read /proc/self/cgroup: {}", err);
            return;
        }
    };

    // cgroups v2: a single "0::<path>" line.
    let Some(path) = cgroup
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
    else {
        return;
    };

    let memory_max = format!("/sys/fs/cgroup{}/memory.max", path);
    match std::fs::read_to_string(&memory_max) {
        Ok(value) => {
            let value = value.trim();
            if value == expected.to_string() {
                log::debug!("Verified {} = {}", memory_max, value);
            } else {
                log::warn!("{} is {} (expected {})", memory_max, value, expected);
            }
        }
        Err(err) => log::debug!("Could not read {}: {}", memory_max, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name("otalacon-abc123"), "otalacon-abc123.scope");
    }
}
