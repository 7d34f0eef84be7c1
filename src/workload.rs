//! Workload command assembly and dependency installation
//!
//! Script workloads get their interpreter in argv slot 0 and, when the
//! project directory carries the ecosystem's manifest, a dependency
//! installer run first. Command workloads run directly unless the joined
//! command line contains shell metacharacters, in which case the whole
//! line is handed to `sh -c`.

use crate::config::{Language, Workload};
use eyre::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

const SHELL_METACHARACTERS: &[char] = &['|', '>', '<', '&', ';'];

const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Fixed environment the installer and the workload run with
pub fn container_env(pwd: &str) -> Vec<(String, String)> {
    vec![
        ("PATH".to_string(), CONTAINER_PATH.to_string()),
        ("TERM".to_string(), "xterm".to_string()),
        ("HOME".to_string(), "/root".to_string()),
        ("container".to_string(), "otala-runc".to_string()),
        ("OLDPWD".to_string(), "/".to_string()),
        ("HOSTNAME".to_string(), "otala-runc".to_string()),
        ("SHLVL".to_string(), "0".to_string()),
        ("PWD".to_string(), pwd.to_string()),
    ]
}

/// Probe the project directory for the language's manifest and return the
/// installer argv to run, if any.
pub fn installer_for(language: Language, workdir: &Path) -> Option<Vec<String>> {
    match language {
        Language::Python => {
            if workdir.join("requirements.txt").exists() {
                log::info!("Found requirements.txt in project directory");
                Some(svec(&["pip3", "install", "-r", "requirements.txt"]))
            } else {
                log::debug!("No requirements.txt found in project directory");
                None
            }
        }
        Language::Javascript => {
            if workdir.join("package.json").exists() {
                log::info!("Found package.json in project directory");
                if workdir.join("yarn.lock").exists() {
                    log::info!("Found yarn.lock, installing with yarn");
                    Some(svec(&["yarn", "install"]))
                } else {
                    Some(svec(&["npm", "install"]))
                }
            } else {
                log::debug!("No package.json found in project directory");
                None
            }
        }
        Language::Golang => {
            if workdir.join("go.mod").exists() {
                log::info!("Found go.mod in project directory");
                if workdir.join("go.sum").exists() {
                    log::debug!("Found go.sum in project directory");
                }
                Some(svec(&["go", "mod", "download"]))
            } else {
                log::debug!("No go.mod found in project directory");
                None
            }
        }
        // No manifest convention to probe for the rest.
        Language::Rust | Language::Java | Language::Bash => None,
    }
}

/// Run the dependency installer inside the staged root, from the project
/// directory. A failing installer aborts the bring-up.
pub fn install_dependencies(argv: &[String], workdir: &Path) -> Result<()> {
    log::info!("Installing dependencies: {:?}", argv);

    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(workdir)
        .env_clear()
        .envs(container_env(&workdir.display().to_string()))
        .status()
        .wrap_err_with(|| format!("spawning installer {:?}", argv[0]))?;

    if !status.success() {
        bail!("dependency installation failed with {}", status);
    }

    log::info!("Dependencies installed successfully");
    Ok(())
}

/// Build the final exec argv for the workload.
pub fn assemble_argv(workload: &Workload) -> Result<Vec<String>> {
    match workload {
        Workload::Script {
            language,
            path,
            args,
        } => {
            let mut argv = match language {
                Language::Python => svec(&["python3"]),
                Language::Javascript => svec(&["node"]),
                Language::Golang => svec(&["go", "run"]),
                Language::Bash => svec(&["bash"]),
                Language::Java => svec(&["java"]),
                // Single .rs files have no interpreter; treat the project
                // directory as a cargo workspace.
                Language::Rust => svec(&["cargo", "run"]),
            };
            if *language != Language::Rust {
                argv.push(path.clone());
            }
            argv.extend(args.iter().cloned());
            Ok(argv)
        }
        Workload::Command { argv } => {
            if argv.is_empty() {
                bail!("empty command");
            }
            let joined = argv.join(" ");
            if joined.contains(SHELL_METACHARACTERS) {
                Ok(vec!["sh".to_string(), "-c".to_string(), joined])
            } else {
                Ok(argv.clone())
            }
        }
    }
}

fn svec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command(line: &str) -> Workload {
        Workload::Command {
            argv: line.split_whitespace().map(str::to_string).collect(),
        }
    }

    #[test]
    fn test_plain_command_runs_directly() -> Result<()> {
        let argv = assemble_argv(&command("ls /MDIR-abc"))?;
        assert_eq!(argv, vec!["ls", "/MDIR-abc"]);
        Ok(())
    }

    #[test]
    fn test_pipe_rewraps_through_shell() -> Result<()> {
        let argv = assemble_argv(&command("echo foo | tr o 0"))?;
        assert_eq!(argv, vec!["sh", "-c", "echo foo | tr o 0"]);
        Ok(())
    }

    #[test]
    fn test_each_metacharacter_triggers_shell() -> Result<()> {
        for line in [
            "echo a > out",
            "cat < in",
            "true && false",
            "true || false",
            "true ; false",
        ] {
            let argv = assemble_argv(&command(line))?;
            assert_eq!(argv[0], "sh", "{:?} should go through sh -c", line);
            assert_eq!(argv[1], "-c");
        }
        Ok(())
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(assemble_argv(&Workload::Command { argv: vec![] }).is_err());
    }

    #[test]
    fn test_script_argv_interpreter_first() -> Result<()> {
        let workload = Workload::Script {
            language: Language::Python,
            path: "main.py".to_string(),
            args: vec!["15".to_string(), "8".to_string()],
        };
        assert_eq!(assemble_argv(&workload)?, vec!["python3", "main.py", "15", "8"]);

        let workload = Workload::Script {
            language: Language::Golang,
            path: "main.go".to_string(),
            args: vec![],
        };
        assert_eq!(assemble_argv(&workload)?, vec!["go", "run", "main.go"]);

        let workload = Workload::Script {
            language: Language::Javascript,
            path: "index.js".to_string(),
            args: vec![],
        };
        assert_eq!(assemble_argv(&workload)?, vec!["node", "index.js"]);
        Ok(())
    }

    #[test]
    fn test_installer_probes_python_manifest() -> Result<()> {
        let tmp = TempDir::new()?;

        assert!(installer_for(Language::Python, tmp.path()).is_none());

        std::fs::write(tmp.path().join("requirements.txt"), "")?;
        assert_eq!(
            installer_for(Language::Python, tmp.path()),
            Some(svec(&["pip3", "install", "-r", "requirements.txt"]))
        );
        Ok(())
    }

    #[test]
    fn test_installer_prefers_yarn_when_locked() -> Result<()> {
        let tmp = TempDir::new()?;
        std::fs::write(tmp.path().join("package.json"), "{}")?;

        assert_eq!(
            installer_for(Language::Javascript, tmp.path()),
            Some(svec(&["npm", "install"]))
        );

        std::fs::write(tmp.path().join("yarn.lock"), "")?;
        assert_eq!(
            installer_for(Language::Javascript, tmp.path()),
            Some(svec(&["yarn", "install"]))
        );
        Ok(())
    }

    #[test]
    fn test_installer_probes_go_manifest() -> Result<()> {
        let tmp = TempDir::new()?;
        std::fs::write(tmp.path().join("go.mod"), "module example.com/app\n")?;

        assert_eq!(
            installer_for(Language::Golang, tmp.path()),
            Some(svec(&["go", "mod", "download"]))
        );
        Ok(())
    }

    #[test]
    fn test_no_installer_for_bash() -> Result<()> {
        let tmp = TempDir::new()?;
        assert!(installer_for(Language::Bash, tmp.path()).is_none());
        Ok(())
    }

    #[test]
    fn test_container_env_fixed_entries() {
        let env = container_env("/MDIR-abc");
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(lookup("HOSTNAME"), "otala-runc");
        assert_eq!(lookup("container"), "otala-runc");
        assert_eq!(lookup("PWD"), "/MDIR-abc");
        assert!(lookup("PATH").starts_with("/usr/local/sbin"));
    }
}
