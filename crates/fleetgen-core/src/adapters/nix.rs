//! Nix-backed evaluator, builder and activator.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use generation_store::{ActivationContext, Activator, Artifact, ContentHash, HostId};
use nix_fleet_adapter::{EvaluatedDrv, NixCli, NixError, SecretFile, SwitchTarget, Switcher};

use super::{Builder, EvaluatedGraph, Evaluator};
use crate::error::{BuildError, EvalError};
use crate::registry::Host;

#[derive(Debug, Clone, Default)]
pub struct NixEvaluator {
    cli: NixCli,
}

impl NixEvaluator {
    pub fn new(cli: NixCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Evaluator for NixEvaluator {
    async fn evaluate(&self, host: &Host) -> Result<EvaluatedGraph, EvalError> {
        let drv = self
            .cli
            .evaluate(&host.config_ref, host.platform)
            .await
            .map_err(|e| match e {
                NixError::EvalFailed { message, location } => EvalError { message, location },
                other => EvalError::new(other.to_string()),
            })?;
        Ok(EvaluatedGraph {
            host: host.id.clone(),
            installable: drv.installable,
            derivation: drv.drv_path,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NixBuilder {
    cli: NixCli,
}

impl NixBuilder {
    pub fn new(cli: NixCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Builder for NixBuilder {
    async fn build(&self, graph: &EvaluatedGraph) -> Result<Artifact, BuildError> {
        let drv = EvaluatedDrv {
            installable: graph.installable.clone(),
            drv_path: graph.derivation.clone(),
        };
        let built = self.cli.build(&drv).await.map_err(|e| match e {
            NixError::BuildFailed {
                message,
                failed_step,
            } => BuildError {
                message,
                failed_step,
            },
            other => BuildError::new(other.to_string(), graph.derivation.clone()),
        })?;
        let content_hash = ContentHash::try_from(built.content_hash)
            .map_err(|e| BuildError::new(e.to_string(), "hash"))?;
        Ok(Artifact {
            content_hash,
            path: built.out_path,
        })
    }
}

struct HostTarget {
    target: SwitchTarget,
    secret_dests: HashMap<String, PathBuf>,
}

/// Switches registry hosts with [`Switcher`].
pub struct NixActivator {
    switcher: Switcher,
    targets: HashMap<HostId, HostTarget>,
}

impl NixActivator {
    pub fn new(switcher: Switcher, hosts: &[Host]) -> Self {
        let targets = hosts
            .iter()
            .map(|host| {
                let target = SwitchTarget {
                    address: host.address.clone(),
                    platform: host.platform,
                };
                let secret_dests = host
                    .secrets
                    .iter()
                    .map(|s| (s.name.clone(), s.dest.clone()))
                    .collect();
                (
                    host.id.clone(),
                    HostTarget {
                        target,
                        secret_dests,
                    },
                )
            })
            .collect();
        Self { switcher, targets }
    }
}

#[async_trait]
impl Activator for NixActivator {
    async fn switch(
        &self,
        host: &HostId,
        artifact: &Artifact,
        context: &ActivationContext,
    ) -> anyhow::Result<()> {
        let entry = self
            .targets
            .get(host)
            .with_context(|| format!("host {host} is not in the registry"))?;

        let mut secrets = Vec::with_capacity(context.secrets.len());
        for mount in &context.secrets {
            let dest = entry
                .secret_dests
                .get(&mount.name)
                .with_context(|| format!("secret {} is not declared for {host}", mount.name))?;
            secrets.push(SecretFile {
                name: mount.name.clone(),
                source: mount.path.clone(),
                dest: dest.clone(),
                owner: mount.owner.clone(),
                mode: mount.mode,
            });
        }

        self.switcher
            .switch(&entry.target, &artifact.path, &secrets)
            .await
            .with_context(|| format!("switching {host} to {}", artifact.path.display()))
    }

    async fn artifact_exists(&self, _host: &HostId, artifact: &Artifact) -> anyhow::Result<bool> {
        Ok(self.switcher.cli().path_exists(&artifact.path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix_fleet_adapter::Platform;

    fn host_with_secret() -> Host {
        Host {
            id: HostId::new("web1").unwrap(),
            platform: Platform::NixOs,
            config_ref: ".#nixosConfigurations.web1".into(),
            address: Some("root@web1".into()),
            reachable: true,
            health_url: None,
            lint: None,
            secrets: vec![crate::secrets::SecretRef {
                name: "db".into(),
                source: "db.enc".into(),
                host: HostId::new("web1").unwrap(),
                owner: None,
                mode: 0o400,
                dest: PathBuf::from("/run/fleetgen-secrets/db"),
            }],
            tests: vec![],
        }
    }

    #[tokio::test]
    async fn test_unknown_host_is_refused() {
        let activator = NixActivator::new(Switcher::default(), &[host_with_secret()]);
        let artifact = Artifact {
            content_hash: ContentHash::from_bytes(b"x"),
            path: PathBuf::from("/nix/store/x"),
        };
        let err = activator
            .switch(
                &HostId::new("ghost").unwrap(),
                &artifact,
                &ActivationContext::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in the registry"));
    }

    #[tokio::test]
    async fn test_undeclared_secret_is_refused() {
        let activator = NixActivator::new(Switcher::default(), &[host_with_secret()]);
        let artifact = Artifact {
            content_hash: ContentHash::from_bytes(b"x"),
            path: PathBuf::from("/nix/store/x"),
        };
        let context = ActivationContext::with_secrets(vec![generation_store::SecretMount {
            name: "other".into(),
            path: PathBuf::from("/tmp/other"),
            owner: None,
            mode: 0o400,
        }]);
        let err = activator
            .switch(&HostId::new("web1").unwrap(), &artifact, &context)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }
}
