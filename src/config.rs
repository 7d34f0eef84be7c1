//! Launch configuration shared between the Supervisor and the Payload
//!
//! A `RunConfig` is built once by the CLI layer, completed with the resolved
//! container identity by the Supervisor, and streamed to the Payload over the
//! handshake pipe. It never changes after that point.

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Interpreted language of a script workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Golang,
    Rust,
    Java,
    Bash,
}

impl FromStr for Language {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        // "js" and "go" are accepted as shorthand and canonicalized here,
        // so the rest of the runtime only ever sees one spelling per language.
        match s.to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "javascript" | "js" => Ok(Language::Javascript),
            "golang" | "go" => Ok(Language::Golang),
            "rust" => Ok(Language::Rust),
            "java" => Ok(Language::Java),
            "bash" => Ok(Language::Bash),
            other => bail!("unsupported language: {}", other),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Golang => "golang",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Bash => "bash",
        };
        f.write_str(name)
    }
}

/// What the container runs after bring-up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Workload {
    /// A script file executed through its language interpreter
    Script {
        language: Language,
        path: String,
        args: Vec<String>,
    },
    /// A pre-tokenized command line
    Command { argv: Vec<String> },
}

/// How the source directory becomes visible inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Bind-mount the host directory (changes propagate back)
    Bind,
    /// Recursively copy the contents into the overlay
    Copy,
}

/// The immutable launch descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub network_enabled: bool,
    pub memory_limit_mib: u64,
    pub source_path: PathBuf,
    pub source_mode: SourceMode,
    pub workload: Workload,
    pub delete_on_exit: bool,
    /// Resolved by the Supervisor from the identity file; empty until then
    pub container_id: String,
}

impl RunConfig {
    /// Memory limit in bytes, binary megabytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mib * 1024 * 1024
    }

    /// Name of the transient scope unit owning this container's cgroup
    pub fn container_name(&self) -> String {
        format!("otalacon-{}", self.container_id)
    }

    /// Name of the in-container directory holding the user's project
    pub fn workdir_name(&self) -> String {
        format!("MDIR-{}", self.container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_canonicalization() -> Result<()> {
        assert_eq!("js".parse::<Language>()?, Language::Javascript);
        assert_eq!("javascript".parse::<Language>()?, Language::Javascript);
        assert_eq!("go".parse::<Language>()?, Language::Golang);
        assert_eq!("golang".parse::<Language>()?, Language::Golang);
        assert_eq!("Python".parse::<Language>()?, Language::Python);
        Ok(())
    }

    #[test]
    fn test_language_rejects_unknown() {
        assert!("perl".parse::<Language>().is_err());
    }

    #[test]
    fn test_memory_limit_conversion() {
        let config = RunConfig {
            network_enabled: false,
            memory_limit_mib: 64,
            source_path: PathBuf::from("/tmp/app"),
            source_mode: SourceMode::Copy,
            workload: Workload::Command {
                argv: vec!["true".to_string()],
            },
            delete_on_exit: false,
            container_id: "abc123".to_string(),
        };

        assert_eq!(config.memory_limit_bytes(), 67_108_864);
    }

    #[test]
    fn test_derived_names() {
        let config = RunConfig {
            network_enabled: true,
            memory_limit_mib: 100,
            source_path: PathBuf::from("/tmp/app"),
            source_mode: SourceMode::Bind,
            workload: Workload::Command {
                argv: vec!["ls".to_string()],
            },
            delete_on_exit: false,
            container_id: "k3x9p2".to_string(),
        };

        assert_eq!(config.container_name(), "otalacon-k3x9p2");
        assert_eq!(config.workdir_name(), "MDIR-k3x9p2");
    }

    #[test]
    fn test_run_config_round_trips_through_json() -> Result<()> {
        let config = RunConfig {
            network_enabled: true,
            memory_limit_mib: 128,
            source_path: PathBuf::from("/data/project"),
            source_mode: SourceMode::Copy,
            workload: Workload::Script {
                language: Language::Python,
                path: "main.py".to_string(),
                args: vec!["--fast".to_string()],
            },
            delete_on_exit: true,
            container_id: "deadbeef".to_string(),
        };

        let encoded = serde_json::to_vec(&config)?;
        let decoded: RunConfig = serde_json::from_slice(&encoded)?;

        assert_eq!(decoded.memory_limit_mib, 128);
        assert_eq!(decoded.container_id, "deadbeef");
        match decoded.workload {
            Workload::Script { language, path, .. } => {
                assert_eq!(language, Language::Python);
                assert_eq!(path, "main.py");
            }
            _ => panic!("expected script workload"),
        }
        Ok(())
    }
}
