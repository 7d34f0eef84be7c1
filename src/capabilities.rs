//! Capability lockdown
//!
//! Two phases, in order. First the bounding set is reduced so nothing the
//! workload ever execs can regain a dropped capability; then the effective,
//! permitted, inheritable and ambient sets are replaced with the configured
//! lists. The bounding set is never rewritten in the second phase (the
//! kernel only lets it shrink).

use crate::policy::CapabilitySets;
use caps::{CapSet, Capability, CapsHashSet};
use eyre::{Context, Result};
use std::str::FromStr;

/// Whether the current process holds any effective capability.
///
/// Freshly cloned into an unmapped user namespace the answer is no; after
/// the uid map is written and the process re-execs, it becomes yes.
pub fn has_effective_caps() -> Result<bool> {
    let effective =
        caps::read(None, CapSet::Effective).wrap_err("reading effective capability set")?;
    Ok(!effective.is_empty())
}

/// Apply the configured capability sets to the current process.
pub fn apply(sets: &CapabilitySets) -> Result<()> {
    reduce_bounding(&sets.bounding)?;

    // Inheritable first, while the effective set still holds CAP_SETPCAP.
    let inheritable = parse_set(&sets.inheritable);
    caps::set(None, CapSet::Inheritable, &inheritable)
        .map_err(|e| eyre::eyre!("setting inheritable capabilities: {}", e))?;

    let permitted = parse_set(&sets.permitted);
    caps::set(None, CapSet::Permitted, &permitted)
        .map_err(|e| eyre::eyre!("setting permitted capabilities: {}", e))?;

    let effective = parse_set(&sets.effective);
    caps::set(None, CapSet::Effective, &effective)
        .map_err(|e| eyre::eyre!("setting effective capabilities: {}", e))?;

    // Ambient last: each raise requires the capability in both permitted
    // and inheritable.
    caps::clear(None, CapSet::Ambient)
        .map_err(|e| eyre::eyre!("clearing ambient capabilities: {}", e))?;
    let ambient = parse_set(&sets.ambient);
    caps::set(None, CapSet::Ambient, &ambient)
        .map_err(|e| eyre::eyre!("setting ambient capabilities: {}", e))?;

    log::debug!(
        "Capabilities applied: effective={:?} ambient={:?}",
        effective,
        ambient
    );
    Ok(())
}

/// Drop every capability not in `allowed` from the bounding set.
fn reduce_bounding(allowed: &[String]) -> Result<()> {
    let allowed = parse_set(allowed);

    for cap in caps::all() {
        if allowed.contains(&cap) {
            continue;
        }
        // Capabilities this kernel does not know cannot be dropped and do
        // not need to be.
        match caps::has_cap(None, CapSet::Bounding, cap) {
            Ok(true) => {}
            _ => continue,
        }
        caps::drop(None, CapSet::Bounding, cap)
            .map_err(|e| eyre::eyre!("dropping {} from bounding set: {}", cap, e))?;
    }

    Ok(())
}

/// Parse capability names, skipping unknown ones; they may belong to a
/// newer kernel than this build knows about.
fn parse_set(names: &[String]) -> CapsHashSet {
    let mut set = CapsHashSet::new();
    for name in names {
        match Capability::from_str(name) {
            Ok(cap) => {
                set.insert(cap);
            }
            Err(_) => log::debug!("Skipping unknown capability {:?}", name),
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_known_names() {
        let set = parse_set(&[
            "CAP_CHOWN".to_string(),
            "CAP_NET_BIND_SERVICE".to_string(),
        ]);
        assert!(set.contains(&Capability::CAP_CHOWN));
        assert!(set.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_parse_set_skips_unknown_names() {
        let set = parse_set(&[
            "CAP_CHOWN".to_string(),
            "CAP_FROM_THE_FUTURE".to_string(),
        ]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn test_template_capability_names_all_resolve() -> Result<()> {
        let policy = crate::policy::LockdownPolicy::from_slice(crate::CONFIG_TEMPLATE)?;
        let parsed = parse_set(&policy.capabilities.bounding);
        assert_eq!(parsed.len(), policy.capabilities.bounding.len());
        Ok(())
    }

    #[test]
    fn test_has_effective_caps_runs() -> Result<()> {
        // Whatever the answer is on the test machine, the probe must work.
        has_effective_caps()?;
        Ok(())
    }
}
