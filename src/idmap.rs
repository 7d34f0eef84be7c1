//! sub-UID/GID range discovery and user-namespace map application
//!
//! Mapping happens from outside the child's user namespace, through the
//! set-uid `newuidmap`/`newgidmap` helpers. Ranges come from `getsubids`,
//! queried by user name and by numeric id (the two can disagree on some
//! systems); equal ranges are deduplicated.
//!
//! The produced map always starts with `0 <self-id> 1`, so the current user
//! becomes root inside the container, and each sub-range follows at a
//! running container-side offset starting at 1.

use eyre::{bail, eyre, Context, Result};
use nix::unistd::{getuid, Pid, User};
use std::process::Command;

/// One contiguous delegated id range on the host side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubIdRange {
    pub start: u32,
    pub length: u32,
}

/// Discover ranges and apply both maps to `pid`. Any helper failure is fatal.
pub fn apply(pid: Pid) -> Result<()> {
    let uid = getuid();
    let user = User::from_uid(uid)
        .wrap_err("looking up current user")?
        .ok_or_else(|| eyre!("uid {} has no passwd entry", uid))?;

    let helper = getsubids_helper();
    let uid_str = uid.as_raw().to_string();

    let uid_ranges = discover_ranges(&helper, false, &user.name, &uid_str);
    let gid_ranges = discover_ranges(&helper, true, &user.name, &uid_str);

    let uid_map = compose_map(uid.as_raw(), &uid_ranges);
    let gid_map = compose_map(user.gid.as_raw(), &gid_ranges);

    log::debug!("uid map for pid {}: {:?}", pid, uid_map);
    log::debug!("gid map for pid {}: {:?}", pid, gid_map);

    run_map_helper("newuidmap", pid, &uid_map)?;
    run_map_helper("newgidmap", pid, &gid_map)?;

    Ok(())
}

/// Helper name, overridable through the environment for test systems where
/// `getsubids` lives under a different name.
fn getsubids_helper() -> String {
    std::env::var("GETSUBIDS").unwrap_or_else(|_| "getsubids".to_string())
}

/// Query the helper for both spellings of the user and deduplicate.
///
/// Individual queries failing is normal (many systems only answer one of
/// the two), so failures here only drop that query's result.
fn discover_ranges(helper: &str, gid: bool, name: &str, uid: &str) -> Vec<SubIdRange> {
    let mut ranges = Vec::new();

    for who in [name, uid] {
        match query_subids(helper, gid, who) {
            Ok(range) => ranges.push(range),
            Err(err) => log::debug!("getsubids({}, gid={}) failed: {:#}", who, gid, err),
        }
    }

    dedup_ranges(ranges)
}

fn query_subids(helper: &str, gid: bool, who: &str) -> Result<SubIdRange> {
    let mut command = Command::new(helper);
    if gid {
        command.arg("-g");
    }
    command.arg(who);

    let output = command
        .output()
        .wrap_err_with(|| format!("spawning {}", helper))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            helper,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_subids_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the `getsubids` output format: `0: username 100000 65536`.
fn parse_subids_output(output: &str) -> Result<SubIdRange> {
    let fields: Vec<&str> = output.trim().split_whitespace().collect();
    if fields.len() < 4 {
        bail!(
            "unexpected getsubids output {:?} ({} fields, expected at least 4)",
            output.trim(),
            fields.len()
        );
    }

    let start = fields[2]
        .parse::<u32>()
        .wrap_err_with(|| format!("parsing range start {:?}", fields[2]))?;
    let length = fields[3]
        .parse::<u32>()
        .wrap_err_with(|| format!("parsing range length {:?}", fields[3]))?;

    Ok(SubIdRange { start, length })
}

fn dedup_ranges(ranges: Vec<SubIdRange>) -> Vec<SubIdRange> {
    let mut seen = std::collections::HashSet::new();
    ranges.into_iter().filter(|r| seen.insert(*r)).collect()
}

/// Compose the helper argument list: `(container, host, length)` triples,
/// starting with the identity triple for the current user.
pub fn compose_map(self_id: u32, ranges: &[SubIdRange]) -> Vec<String> {
    let mut map = vec!["0".to_string(), self_id.to_string(), "1".to_string()];

    let mut offset: u64 = 1;
    for range in ranges {
        map.push(offset.to_string());
        map.push(range.start.to_string());
        map.push(range.length.to_string());
        offset += u64::from(range.length);
    }

    map
}

fn run_map_helper(helper: &str, pid: Pid, map: &[String]) -> Result<()> {
    let output = Command::new(helper)
        .arg(pid.to_string())
        .args(map)
        .output()
        .wrap_err_with(|| format!("spawning {}", helper))?;

    if !output.status.success() {
        bail!(
            "{} {} {:?} failed with {}: {}",
            helper,
            pid,
            map,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}
