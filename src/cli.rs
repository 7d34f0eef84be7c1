//! Command-line interface

use crate::config::{Language, RunConfig, SourceMode, Workload};
use clap::{ArgAction, Args, Parser, Subcommand};
use eyre::{bail, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "otala-runc")]
#[command(version)]
#[command(about = "Rootless single-shot container runtime")]
#[command(
    long_about = "Runs a host directory's script or command inside an isolated \
                  container built from Linux user namespaces, an overlay \
                  filesystem, a cgroups-v2 scope, capability sets and a seccomp \
                  filter, without ever requiring root."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a container with the given configuration
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Enable user-mode networking (pass false to disable)
    #[arg(long = "net", short = 'n', default_value_t = true, action = ArgAction::Set)]
    pub net: bool,

    /// Memory limit in MiB
    #[arg(long = "memory-limit", visible_alias = "ml", default_value_t = 100)]
    pub memory_limit: u64,

    /// Copy this host directory into the container
    #[arg(long = "copy", visible_alias = "cp")]
    pub copy: Option<PathBuf>,

    /// Bind-mount this host directory into the container
    #[arg(long = "mount", short = 'm')]
    pub mount: Option<PathBuf>,

    /// Runtime language of the script (python, javascript, golang, rust, java, bash)
    #[arg(long, short = 'l')]
    pub language: Option<String>,

    /// Path of the script to execute, relative to the copy/mount directory
    #[arg(long, short = 's')]
    pub script: Option<String>,

    /// Direct command to execute instead of a script
    #[arg(long = "command", visible_alias = "cmd")]
    pub command: Option<String>,

    /// Arguments passed to the script or command (repeatable)
    #[arg(long = "args", short = 'a', action = ArgAction::Append)]
    pub args: Vec<String>,

    /// Delete the container's storage when execution completes
    #[arg(long, short = 'd')]
    pub delete: bool,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl RunArgs {
    /// Validate the flags and assemble the launch descriptor.
    pub fn into_config(self) -> Result<RunConfig> {
        if self.script.is_some() && self.command.is_some() {
            bail!("cannot specify both --script and --command, choose one");
        }
        if self.script.is_none() && self.command.is_none() {
            bail!("must specify either --script or --command");
        }
        if self.copy.is_some() && self.mount.is_some() {
            bail!("cannot use both --copy and --mount, choose one");
        }

        // With neither flag, the current directory is copied in.
        let (source_path, source_mode) = match (self.copy, self.mount) {
            (Some(path), None) => (path, SourceMode::Copy),
            (None, Some(path)) => (path, SourceMode::Bind),
            (None, None) => (std::env::current_dir()?, SourceMode::Copy),
            (Some(_), Some(_)) => unreachable!(),
        };

        if !source_path.is_absolute() {
            bail!(
                "{} path must be absolute: {}",
                match source_mode {
                    SourceMode::Copy => "copy",
                    SourceMode::Bind => "mount",
                },
                source_path.display()
            );
        }
        if !source_path.exists() {
            bail!("source path does not exist: {}", source_path.display());
        }

        let workload = match (self.script, self.command) {
            (Some(script), None) => {
                let Some(language) = self.language else {
                    bail!("--language is required when using --script");
                };
                let language: Language = language.parse()?;

                let script_path = source_path.join(&script);
                if !script_path.exists() {
                    bail!(
                        "script file does not exist: {} at this dir: {}",
                        script,
                        script_path.display()
                    );
                }

                Workload::Script {
                    language,
                    path: script,
                    args: self.args,
                }
            }
            (None, Some(command)) => {
                let mut argv: Vec<String> =
                    command.split_whitespace().map(str::to_string).collect();
                if argv.is_empty() {
                    bail!("--command is empty");
                }
                argv.extend(self.args);

                Workload::Command { argv }
            }
            _ => unreachable!("validated above"),
        };

        Ok(RunConfig {
            network_enabled: self.net,
            memory_limit_mib: self.memory_limit,
            source_path,
            source_mode,
            workload,
            delete_on_exit: self.delete,
            container_id: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal_args() -> RunArgs {
        RunArgs {
            net: true,
            memory_limit: 100,
            copy: None,
            mount: None,
            language: None,
            script: None,
            command: Some("true".to_string()),
            args: vec![],
            delete: false,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_cli_parses() {
        // clap derive consistency check
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_script_and_command_are_exclusive() {
        let mut args = minimal_args();
        args.script = Some("main.py".to_string());
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_one_of_script_or_command_required() {
        let mut args = minimal_args();
        args.command = None;
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_copy_and_mount_are_exclusive() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut args = minimal_args();
        args.copy = Some(tmp.path().to_path_buf());
        args.mount = Some(tmp.path().to_path_buf());
        assert!(args.into_config().is_err());
        Ok(())
    }

    #[test]
    fn test_relative_source_rejected() {
        let mut args = minimal_args();
        args.copy = Some(PathBuf::from("relative/path"));
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_missing_source_rejected() {
        let mut args = minimal_args();
        args.mount = Some(PathBuf::from("/definitely/not/here"));
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_defaults_to_copying_cwd() -> Result<()> {
        let config = minimal_args().into_config()?;
        assert_eq!(config.source_mode, SourceMode::Copy);
        assert_eq!(config.source_path, std::env::current_dir()?);
        Ok(())
    }

    #[test]
    fn test_mount_selects_bind_mode() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut args = minimal_args();
        args.mount = Some(tmp.path().to_path_buf());

        let config = args.into_config()?;
        assert_eq!(config.source_mode, SourceMode::Bind);
        assert_eq!(config.source_path, tmp.path());
        Ok(())
    }

    #[test]
    fn test_script_requires_language() -> Result<()> {
        let tmp = TempDir::new()?;
        std::fs::write(tmp.path().join("main.py"), "print('hi')\n")?;

        let mut args = minimal_args();
        args.copy = Some(tmp.path().to_path_buf());
        args.command = None;
        args.script = Some("main.py".to_string());
        assert!(args.into_config().is_err());
        Ok(())
    }

    #[test]
    fn test_script_must_exist_in_source() -> Result<()> {
        let tmp = TempDir::new()?;

        let mut args = minimal_args();
        args.copy = Some(tmp.path().to_path_buf());
        args.command = None;
        args.script = Some("main.py".to_string());
        args.language = Some("python".to_string());
        assert!(args.into_config().is_err());
        Ok(())
    }

    #[test]
    fn test_script_workload_with_canonical_language() -> Result<()> {
        let tmp = TempDir::new()?;
        std::fs::write(tmp.path().join("index.js"), "console.log('hi')\n")?;

        let mut args = minimal_args();
        args.copy = Some(tmp.path().to_path_buf());
        args.command = None;
        args.script = Some("index.js".to_string());
        args.language = Some("js".to_string());
        args.args = vec!["15".to_string()];

        let config = args.into_config()?;
        match config.workload {
            Workload::Script {
                language,
                path,
                args,
            } => {
                assert_eq!(language, Language::Javascript);
                assert_eq!(path, "index.js");
                assert_eq!(args, vec!["15"]);
            }
            _ => panic!("expected script workload"),
        }
        Ok(())
    }

    #[test]
    fn test_command_is_tokenized_with_extra_args() -> Result<()> {
        let mut args = minimal_args();
        args.command = Some("echo foo | tr o 0".to_string());
        args.args = vec!["trailing".to_string()];

        let config = args.into_config()?;
        match config.workload {
            Workload::Command { argv } => {
                assert_eq!(argv, vec!["echo", "foo", "|", "tr", "o", "0", "trailing"]);
            }
            _ => panic!("expected command workload"),
        }
        Ok(())
    }
}
