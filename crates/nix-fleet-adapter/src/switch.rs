//! Switching a host to a realised system closure
//!
//! For remote hosts the closure is copied with `nix copy --to ssh://...` and
//! every host-side step runs through `ssh`. Local hosts run the same steps
//! through `sh -c`. The switch is all-or-nothing: if activation fails after
//! the profile moved, the previous profile generation is restored and
//! re-activated before the error is returned.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::command::{self, NixCli};
use crate::error::NixError;
use crate::flake::Platform;
use crate::Result;

const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";
const HOME_MANAGER_PROFILE: &str = "$HOME/.local/state/nix/profiles/home-manager";

/// Where and what kind of system to switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTarget {
    /// `user@host` for ssh; `None` switches the local machine
    pub address: Option<String>,
    pub platform: Platform,
}

impl SwitchTarget {
    pub fn local(platform: Platform) -> Self {
        Self {
            address: None,
            platform,
        }
    }

    pub fn remote(address: impl Into<String>, platform: Platform) -> Self {
        Self {
            address: Some(address.into()),
            platform,
        }
    }

    pub fn profile(&self) -> &'static str {
        match self.platform {
            Platform::NixOs | Platform::Darwin => SYSTEM_PROFILE,
            Platform::HomeManager => HOME_MANAGER_PROFILE,
        }
    }
}

/// A decrypted secret staged on the controller, to be installed on the host.
#[derive(Debug, Clone)]
pub struct SecretFile {
    pub name: String,
    /// Plaintext file on the controller
    pub source: PathBuf,
    /// Destination path on the host
    pub dest: PathBuf,
    pub owner: Option<String>,
    pub mode: u32,
}

/// Drives the copy, profile and activation steps of a switch.
#[derive(Debug, Clone)]
pub struct Switcher {
    cli: NixCli,
    ssh_program: String,
    ssh_options: Vec<String>,
}

impl Default for Switcher {
    fn default() -> Self {
        Self::new(NixCli::default())
    }
}

impl Switcher {
    pub fn new(cli: NixCli) -> Self {
        Self {
            cli,
            ssh_program: "ssh".to_string(),
            ssh_options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
        }
    }

    pub fn with_ssh_options(mut self, options: Vec<String>) -> Self {
        self.ssh_options = options;
        self
    }

    pub fn cli(&self) -> &NixCli {
        &self.cli
    }

    /// Copy, install secrets, move the profile and activate.
    #[instrument(skip(self, secrets), fields(address = ?target.address, platform = %target.platform))]
    pub async fn switch(
        &self,
        target: &SwitchTarget,
        out_path: &Path,
        secrets: &[SecretFile],
    ) -> Result<()> {
        if let Some(address) = &target.address {
            let args = vec![
                "copy".to_string(),
                "--to".to_string(),
                format!("ssh://{address}"),
                out_path.display().to_string(),
            ];
            self.cli.run(&args).await.map_err(|e| step_failed("copy", e))?;
        }

        for secret in secrets {
            self.install_secret(target, secret)
                .await
                .map_err(|e| step_failed("secrets", e))?;
        }

        let profile = target.profile();
        let previous = self
            .on_host(target, &["readlink".into(), "-f".into(), profile.into()])
            .await
            .ok()
            .and_then(|out| out.last_line().map(PathBuf::from));

        self.set_profile(target, out_path)
            .await
            .map_err(|e| step_failed("profile", e))?;

        if let Err(err) = self.activate(target, out_path).await {
            if let Some(previous) = previous {
                warn!(previous = %previous.display(), "activation failed, restoring previous profile");
                if let Err(restore) = self.restore(target, &previous).await {
                    warn!(error = %restore, "restoring previous profile failed");
                }
            }
            return Err(step_failed("activate", err));
        }

        info!(path = %out_path.display(), "switched");
        Ok(())
    }

    async fn install_secret(&self, target: &SwitchTarget, secret: &SecretFile) -> Result<()> {
        let contents = Zeroizing::new(tokio::fs::read(&secret.source).await?);
        let argv = install_argv(secret);
        let (program, args) = self.host_command(target, &argv);
        command::run(&program, &args, Some(contents.as_slice())).await?;
        Ok(())
    }

    async fn set_profile(&self, target: &SwitchTarget, out_path: &Path) -> Result<()> {
        self.on_host(
            target,
            &[
                "nix-env".into(),
                "-p".into(),
                target.profile().into(),
                "--set".into(),
                out_path.display().to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn activate(&self, target: &SwitchTarget, out_path: &Path) -> Result<()> {
        self.on_host(target, &activation_argv(target.platform, out_path))
            .await
            .map(|_| ())
    }

    async fn restore(&self, target: &SwitchTarget, previous: &Path) -> Result<()> {
        self.set_profile(target, previous).await?;
        self.activate(target, previous).await
    }

    async fn on_host(
        &self,
        target: &SwitchTarget,
        argv: &[String],
    ) -> Result<command::CommandOutput> {
        let (program, args) = self.host_command(target, argv);
        command::run(&program, &args, None).await
    }

    /// Program and arguments that run `argv` on the target's shell.
    pub fn host_command(&self, target: &SwitchTarget, argv: &[String]) -> (String, Vec<String>) {
        let script = argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        match &target.address {
            Some(address) => {
                let mut args = self.ssh_options.clone();
                args.push(address.clone());
                args.push("--".to_string());
                args.push(script);
                (self.ssh_program.clone(), args)
            }
            None => ("sh".to_string(), vec!["-c".to_string(), script]),
        }
    }
}

fn step_failed(step: &str, err: NixError) -> NixError {
    NixError::SwitchFailed {
        step: step.to_string(),
        message: err.to_string(),
    }
}

/// Host-side activation command for a closure.
pub fn activation_argv(platform: Platform, out_path: &Path) -> Vec<String> {
    match platform {
        Platform::NixOs => vec![
            out_path
                .join("bin/switch-to-configuration")
                .display()
                .to_string(),
            "switch".to_string(),
        ],
        Platform::Darwin | Platform::HomeManager => {
            vec![out_path.join("activate").display().to_string()]
        }
    }
}

fn install_argv(secret: &SecretFile) -> Vec<String> {
    let mut argv = vec![
        "install".to_string(),
        "-D".to_string(),
        "-m".to_string(),
        format!("{:04o}", secret.mode),
    ];
    if let Some(owner) = &secret.owner {
        argv.push("-o".to_string());
        argv.push(owner.clone());
    }
    argv.push("/dev/stdin".to_string());
    argv.push(secret.dest.display().to_string());
    argv
}

/// Single-quote `arg` for a POSIX shell; a leading `$HOME/` stays expandable.
pub fn shell_quote(arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix("$HOME/") {
        return format!("\"$HOME\"/{}", shell_quote(rest));
    }
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nixos_activation_uses_switch_to_configuration() {
        let argv = activation_argv(Platform::NixOs, Path::new("/nix/store/abc-nixos-system"));
        assert_eq!(
            argv,
            vec![
                "/nix/store/abc-nixos-system/bin/switch-to-configuration",
                "switch"
            ]
        );
        let argv = activation_argv(Platform::Darwin, Path::new("/nix/store/abc-darwin-system"));
        assert_eq!(argv, vec!["/nix/store/abc-darwin-system/activate"]);
    }

    #[test]
    fn test_remote_command_goes_through_ssh() {
        let switcher = Switcher::default().with_ssh_options(vec![]);
        let target = SwitchTarget::remote("root@web1", Platform::NixOs);
        let (program, args) =
            switcher.host_command(&target, &["echo".to_string(), "hello world".to_string()]);
        assert_eq!(program, "ssh");
        assert_eq!(args, vec!["root@web1", "--", "echo 'hello world'"]);
    }

    #[test]
    fn test_profiles_per_platform() {
        assert_eq!(
            SwitchTarget::local(Platform::NixOs).profile(),
            "/nix/var/nix/profiles/system"
        );
        assert!(SwitchTarget::local(Platform::HomeManager)
            .profile()
            .starts_with("$HOME/"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/nix/store/abc"), "/nix/store/abc");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(
            shell_quote("$HOME/.local/state"),
            "\"$HOME\"/.local/state"
        );
    }

    #[test]
    fn test_install_argv_sets_mode_and_owner() {
        let secret = SecretFile {
            name: "db".into(),
            source: PathBuf::from("/run/user/1000/fleetgen/db"),
            dest: PathBuf::from("/run/fleetgen-secrets/db"),
            owner: Some("postgres".into()),
            mode: 0o400,
        };
        assert_eq!(
            install_argv(&secret),
            vec![
                "install",
                "-D",
                "-m",
                "0400",
                "-o",
                "postgres",
                "/dev/stdin",
                "/run/fleetgen-secrets/db"
            ]
        );
    }

    #[tokio::test]
    async fn test_local_host_command_runs_in_shell() {
        let switcher = Switcher::default();
        let target = SwitchTarget::local(Platform::NixOs);
        let out = switcher
            .on_host(&target, &["echo".to_string(), "a b".to_string()])
            .await
            .unwrap();
        assert_eq!(out.last_line(), Some("a b"));
    }

    #[tokio::test]
    async fn test_local_secret_install_writes_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("plain");
        std::fs::write(&source, b"s3cret").unwrap();
        let dest = dir.path().join("installed/db");
        let secret = SecretFile {
            name: "db".into(),
            source,
            dest: dest.clone(),
            owner: None,
            mode: 0o400,
        };

        Switcher::default()
            .install_secret(&SwitchTarget::local(Platform::NixOs), &secret)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"s3cret");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }
}
