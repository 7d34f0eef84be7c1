//! Lockdown policy document
//!
//! Serde model of the config document that travels with the executable and,
//! once augmented with the resolved overlay paths, over the handshake pipe.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Capability names per kernel set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySets {
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
}

/// A single resource limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub soft: u64,
    pub hard: u64,
}

/// Architecture entry of the seccomp section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchMapEntry {
    pub architecture: String,
    #[serde(rename = "subArchitectures", default)]
    pub sub_architectures: Vec<String>,
}

/// Argument predicate on one syscall argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallArg {
    pub index: u8,
    pub value: u64,
    pub op: String,
}

/// One syscall rule: a set of names sharing an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: String,
    #[serde(rename = "errnoRet", default, skip_serializing_if = "Option::is_none")]
    pub errno_ret: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<SyscallArg>,
}

/// The seccomp section of the document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeccompPolicy {
    #[serde(rename = "defaultAction", default)]
    pub default_action: String,
    #[serde(rename = "defaultErrnoRet", default)]
    pub default_errno_ret: u32,
    #[serde(rename = "archMap", default)]
    pub arch_map: Vec<ArchMapEntry>,
    #[serde(default)]
    pub syscalls: Vec<SyscallRule>,
}

/// The full lockdown document, with the overlay paths injected at setup time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockdownPolicy {
    #[serde(default)]
    pub capabilities: CapabilitySets,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    #[serde(default)]
    pub seccomp: SeccompPolicy,
    #[serde(default)]
    pub rootfs: PathBuf,
    #[serde(default)]
    pub merged: PathBuf,
    #[serde(default)]
    pub upper: PathBuf,
    #[serde(default)]
    pub work: PathBuf,
}

impl LockdownPolicy {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).wrap_err("parsing lockdown config document")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedded_template() -> Result<()> {
        let policy = LockdownPolicy::from_slice(crate::CONFIG_TEMPLATE)?;

        assert!(policy.capabilities.bounding.contains(&"CAP_CHOWN".to_string()));
        assert_eq!(policy.seccomp.default_action, "SCMP_ACT_ERRNO");
        assert!(!policy.seccomp.syscalls.is_empty());
        assert!(!policy.rlimits.is_empty());
        // Paths are absent until injection.
        assert_eq!(policy.merged, PathBuf::new());
        Ok(())
    }

    #[test]
    fn test_parse_injected_document() -> Result<()> {
        let document = br#"{
            "capabilities": {"bounding": ["CAP_KILL"], "effective": [], "inheritable": [], "permitted": [], "ambient": []},
            "rlimits": [{"type": "RLIMIT_NOFILE", "soft": 64, "hard": 128}],
            "seccomp": {
                "defaultAction": "SCMP_ACT_ERRNO",
                "defaultErrnoRet": 1,
                "archMap": [{"architecture": "SCMP_ARCH_X86_64", "subArchitectures": ["SCMP_ARCH_X86"]}],
                "syscalls": [
                    {"names": ["read", "write"], "action": "SCMP_ACT_ALLOW"},
                    {"names": ["personality"], "action": "SCMP_ACT_ALLOW",
                     "args": [{"index": 0, "value": 8, "op": "SCMP_CMP_EQ"}]},
                    {"names": ["ptrace"], "action": "SCMP_ACT_ERRNO", "errnoRet": 1}
                ]
            },
            "rootfs": "/d/rootfs/alpine",
            "merged": "/d/storage/x/merged",
            "upper": "/d/storage/x/upper",
            "work": "/d/storage/x/work"
        }"#;

        let policy = LockdownPolicy::from_slice(document)?;

        assert_eq!(policy.merged, PathBuf::from("/d/storage/x/merged"));
        assert_eq!(policy.rlimits[0].kind, "RLIMIT_NOFILE");
        assert_eq!(policy.seccomp.syscalls.len(), 3);
        assert_eq!(policy.seccomp.syscalls[1].args[0].op, "SCMP_CMP_EQ");
        assert_eq!(policy.seccomp.syscalls[2].errno_ret, Some(1));
        assert_eq!(
            policy.seccomp.arch_map[0].sub_architectures,
            vec!["SCMP_ARCH_X86"]
        );
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_document() {
        assert!(LockdownPolicy::from_slice(b"not json").is_err());
    }
}
